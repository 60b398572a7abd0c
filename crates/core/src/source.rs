//! Source unit discovery and pragma extraction

use crate::error::BuildResult;
use crate::version::VersionConstraint;
use eyre::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use walkdir::WalkDir;

static PRAGMA_SOLIDITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pragma\s+solidity\s+([^;]+);").expect("valid regex"));

/// One compilation input: a contract source file
#[derive(Debug, Clone, PartialEq)]
pub struct SourceUnit {
    /// Project-relative path with `/` separators, e.g. `contracts/Token.sol`
    pub id: String,
    /// Source text as read when the unit was created
    pub content: String,
    /// Version constraint from `pragma solidity`, if any
    pub declared_version: Option<VersionConstraint>,
}

impl SourceUnit {
    /// Create a unit from source text, reading its pragmas
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> BuildResult<Self> {
        let content = content.into();
        let declared_version = extract_version_constraint(&content)?;
        Ok(Self {
            id: id.into(),
            content,
            declared_version,
        })
    }

    /// Where the unit lives below `project_root`
    pub fn path_in(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.id)
    }

    /// Contract-name-friendly stem of the file (`contracts/Token.sol` -> `Token`)
    pub fn file_stem(&self) -> &str {
        let name = self.id.rsplit('/').next().unwrap_or(&self.id);
        name.strip_suffix(".sol").unwrap_or(name)
    }
}

/// Find all `.sol` files below `sources_dir` and load them as units
///
/// Units are returned sorted by identifier so builds are deterministic.
pub fn discover_sources(project_root: &Path, sources_dir: &Path) -> Result<Vec<SourceUnit>> {
    let root = if sources_dir.is_absolute() {
        sources_dir.to_path_buf()
    } else {
        project_root.join(sources_dir)
    };

    if !root.exists() {
        tracing::warn!("Sources directory does not exist: {}", root.display());
        return Ok(Vec::new());
    }

    let mut units = Vec::new();
    for entry in WalkDir::new(&root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sol") {
            continue;
        }

        let id = unit_id(project_root, path);
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let unit = SourceUnit::new(id, content)
            .with_context(|| format!("Invalid pragma in {}", path.display()))?;
        units.push(unit);
    }

    units.sort_by(|a, b| a.id.cmp(&b.id));
    tracing::debug!("Discovered {} source units in {}", units.len(), root.display());
    Ok(units)
}

/// Project-relative identifier with forward slashes
pub fn unit_id(project_root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(project_root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Combine every `pragma solidity` in the source into one constraint
pub fn extract_version_constraint(content: &str) -> BuildResult<Option<VersionConstraint>> {
    let code = strip_comments(content);
    let mut combined: Option<VersionConstraint> = None;

    for captures in PRAGMA_SOLIDITY.captures_iter(&code) {
        let constraint = VersionConstraint::parse(&captures[1])?;
        combined = Some(match combined {
            Some(existing) => existing.intersect(&constraint),
            None => constraint,
        });
    }

    Ok(combined)
}

/// Remove `//` and `/* */` comments so commented-out pragmas are ignored
fn strip_comments(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut chars = content.chars().peekable();
    let mut in_string: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(quote) = in_string {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == quote {
                in_string = None;
            }
            continue;
        }

        let next = chars.peek().copied();
        match (c, next) {
            ('"' | '\'', _) => {
                in_string = Some(c);
                out.push(c);
            }
            ('/', Some('/')) => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for skipped in chars.by_ref() {
                    if prev == '*' && skipped == '/' {
                        break;
                    }
                    if skipped == '\n' {
                        out.push('\n');
                    }
                    prev = skipped;
                }
            }
            _ => out.push(c),
        }
    }

    out
}
