//! Markdown documentation from ABI and natspec

use super::{existing_outputs, generated_marker, resolve_dir, PostProcessor, ProcessContext};
use crate::artifacts::{abi, writer, BuildArtifact, CompiledContract};
use crate::utils::write_atomic;
use eyre::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocgenConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_order")]
    pub order: i32,
    #[serde(default)]
    pub run_on_build: bool,
    #[serde(default = "default_path")]
    pub path: PathBuf,
    /// Also remove documents of excluded units and files docgen did not
    /// generate; documents of deleted units are always removed
    #[serde(default)]
    pub clear: bool,
    /// Unit identifier patterns to leave undocumented
    #[serde(default)]
    pub except: Vec<String>,
}

fn default_order() -> i32 {
    30
}

fn default_path() -> PathBuf {
    PathBuf::from("docs")
}

#[derive(Debug)]
pub struct DocumentationGenerator {
    name: String,
    order: i32,
    run_on_build: bool,
    path: PathBuf,
    clear: bool,
    except: Vec<Regex>,
}

impl DocumentationGenerator {
    pub fn new(name: String, config: DocgenConfig, project_root: &Path) -> Result<Self> {
        let except = config
            .except
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .with_context(|| format!("Invalid docgen exclusion pattern '{pattern}'"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name,
            order: config.order,
            run_on_build: config.run_on_build,
            path: resolve_dir(project_root, &config.path),
            clear: config.clear,
            except,
        })
    }

    fn is_excluded(&self, unit: &str) -> bool {
        self.except.iter().any(|re| re.is_match(unit))
    }

    /// `contracts/Token.sol` -> `<path>/contracts/Token.md`
    fn document_path(&self, unit: &str) -> PathBuf {
        writer::unit_dir(&self.path, unit).with_extension("md")
    }
}

impl PostProcessor for DocumentationGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn order(&self) -> i32 {
        self.order
    }

    fn run_on_build(&self) -> bool {
        self.run_on_build
    }

    fn output_location(&self) -> &Path {
        &self.path
    }

    fn process(&self, ctx: &ProcessContext<'_>) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for artifact in ctx.artifacts.snapshot() {
            if self.is_excluded(&artifact.unit) {
                tracing::debug!("Skipping docs for excluded unit {}", artifact.unit);
                continue;
            }
            if artifact.contracts.is_empty() {
                continue;
            }

            let path = self.document_path(&artifact.unit);
            write_atomic(&path, render_unit(&artifact).as_bytes())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            written.push(path);
        }

        let retained: BTreeSet<&str> = ctx.retained_units().into_iter().collect();
        let mut keep: BTreeSet<PathBuf> = written.iter().cloned().collect();
        for (path, unit) in existing_outputs(&self.path) {
            let kept = match unit {
                Some(unit) => {
                    ctx.has_unit(&unit) && (!self.clear || retained.contains(unit.as_str()))
                }
                None => !self.clear,
            };
            if kept {
                keep.insert(path);
            }
        }
        writer::reconcile(&self.path, &keep, &[])?;
        Ok(written)
    }
}

/// Markdown document for every contract of one unit
pub fn render_unit(artifact: &BuildArtifact) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "<!-- {} -->", generated_marker(&artifact.unit));
    let _ = writeln!(out);
    let _ = writeln!(out, "# {}", artifact.unit);
    let _ = writeln!(out);
    let _ = writeln!(out, "Compiled with solc {}.", artifact.compiler_version);

    for contract in artifact.contracts.values() {
        render_contract(&mut out, contract);
    }
    out
}

fn render_contract(out: &mut String, contract: &CompiledContract) {
    let _ = writeln!(out);
    let _ = writeln!(out, "## {}", contract.name);

    if let Some(title) = contract.devdoc["title"].as_str() {
        let _ = writeln!(out);
        let _ = writeln!(out, "*{}*", title.trim());
    }
    for text in [&contract.userdoc["notice"], &contract.devdoc["details"]] {
        if let Some(text) = text.as_str() {
            let _ = writeln!(out);
            let _ = writeln!(out, "{}", text.trim());
        }
    }

    let functions: Vec<&Value> = abi::entries(&contract.abi, "function").collect();
    if !functions.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "### Functions");
        for func in functions {
            render_member(out, contract, func, "methods", true);
        }
    }

    let events: Vec<&Value> = abi::entries(&contract.abi, "event").collect();
    if !events.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "### Events");
        for event in events {
            render_member(out, contract, event, "events", false);
        }
    }

    let errors: Vec<&Value> = abi::entries(&contract.abi, "error").collect();
    if !errors.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "### Errors");
        for error in errors {
            render_member(out, contract, error, "errors", false);
        }
    }
}

fn render_member(out: &mut String, contract: &CompiledContract, entry: &Value, section: &str, is_function: bool) {
    let Some(signature) = abi::signature(entry) else {
        return;
    };
    let name = entry["name"].as_str().unwrap_or_default();
    let dev = natspec(&contract.devdoc, section, &signature, name);
    let user = natspec(&contract.userdoc, section, &signature, name);

    let _ = writeln!(out);
    let _ = writeln!(out, "#### {name}");
    let _ = writeln!(out);
    if is_function {
        let _ = writeln!(out, "`{}` (selector `{}`)", signature, abi::selector(&signature));
    } else if section == "events" {
        let _ = writeln!(out, "`{}` (topic `{}`)", signature, abi::event_topic(&signature));
    } else {
        let _ = writeln!(out, "`{signature}`");
    }

    for text in [&user["notice"], &dev["details"]] {
        if let Some(text) = text.as_str() {
            let _ = writeln!(out);
            let _ = writeln!(out, "{}", text.trim());
        }
    }

    let params = entry["inputs"].as_array().map(Vec::as_slice).unwrap_or(&[]);
    if !params.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "| Parameter | Type | Description |");
        let _ = writeln!(out, "| --- | --- | --- |");
        for param in params {
            let pname = param["name"].as_str().unwrap_or_default();
            let doc = dev["params"][pname].as_str().unwrap_or_default();
            let _ = writeln!(out, "| {} | `{}` | {} |", pname, abi::canonical_type(param), cell(doc));
        }
    }

    let returns = entry["outputs"].as_array().map(Vec::as_slice).unwrap_or(&[]);
    if is_function && !returns.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "| Returns | Type | Description |");
        let _ = writeln!(out, "| --- | --- | --- |");
        for (i, param) in returns.iter().enumerate() {
            let rname = param["name"].as_str().filter(|n| !n.is_empty());
            // solc keys unnamed returns as `_0`, `_1`, ...
            let key = rname.map(str::to_string).unwrap_or_else(|| format!("_{i}"));
            let doc = dev["returns"][key.as_str()].as_str().unwrap_or_default();
            let _ = writeln!(
                out,
                "| {} | `{}` | {} |",
                rname.unwrap_or("-"),
                abi::canonical_type(param),
                cell(doc)
            );
        }
    }
}

/// Natspec entry for a member; solc keys functions by signature and
/// older compilers key events by name
fn natspec<'a>(doc: &'a Value, section: &str, signature: &str, name: &str) -> &'a Value {
    let members = &doc[section];
    match &members[signature] {
        Value::Null => &members[name],
        found => found,
    }
}

fn cell(text: &str) -> String {
    text.trim().replace('\n', " ").replace('|', "\\|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::test_support::sample_artifact;
    use crate::artifacts::ArtifactSet;
    use crate::source::SourceUnit;
    use tempfile::TempDir;

    fn generator(root: &Path, clear: bool, except: &[&str]) -> DocumentationGenerator {
        DocumentationGenerator::new(
            "docgen".into(),
            DocgenConfig {
                name: None,
                order: 30,
                run_on_build: false,
                path: PathBuf::from("docs/contracts"),
                clear,
                except: except.iter().map(|s| s.to_string()).collect(),
            },
            root,
        )
        .unwrap()
    }

    #[test]
    fn test_render_includes_natspec() {
        let doc = render_unit(&sample_artifact("contracts/Token.sol", "Token"));

        assert!(doc.starts_with(
            "<!-- Generated by contract-builder from contracts/Token.sol. Do not edit. -->\n\n\
             # contracts/Token.sol\n\nCompiled with solc 0.8.2.\n"
        ));
        assert!(doc.contains("## Token\n\n*Simple token*\n\nMoves tokens around\n"));
        assert!(doc.contains("`transfer(address,uint256)` (selector `0xa9059cbb`)"));
        assert!(doc.contains("Send tokens"));
        assert!(doc.contains("| to | `address` | Recipient |"));
        assert!(doc.contains("| - | `bool` |  |"));
        assert!(doc.contains(
            "`Transfer(address,address,uint256)` (topic `0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef`)"
        ));
    }

    #[test]
    fn test_except_patterns_and_clear() {
        let temp = TempDir::new().unwrap();
        let artifacts = ArtifactSet::new();
        artifacts.insert(sample_artifact("contracts/Token.sol", "Token"));
        artifacts.insert(sample_artifact("contracts/interfaces/IToken.sol", "IToken"));
        let ctx = ProcessContext {
            project_root: temp.path(),
            units: &[],
            artifacts: &artifacts,
        };

        let stale = temp.path().join("docs/contracts/contracts/Old.md");
        write_atomic(&stale, b"old").unwrap();

        let written = generator(temp.path(), true, &["^contracts/interfaces"])
            .process(&ctx)
            .unwrap();
        assert_eq!(
            written,
            vec![temp.path().join("docs/contracts/contracts/Token.md")]
        );
        assert!(!stale.exists());
        assert!(!temp.path().join("docs/contracts/contracts/interfaces").exists());
    }

    #[test]
    fn test_without_clear_keeps_other_documents() {
        let temp = TempDir::new().unwrap();
        let artifacts = ArtifactSet::new();
        artifacts.insert(sample_artifact("contracts/Token.sol", "Token"));
        let ctx = ProcessContext {
            project_root: temp.path(),
            units: &[],
            artifacts: &artifacts,
        };

        let other = temp.path().join("docs/contracts/README.md");
        write_atomic(&other, b"hand written").unwrap();
        generator(temp.path(), false, &[]).process(&ctx).unwrap();
        assert!(other.exists());
    }

    #[test]
    fn test_documents_of_deleted_units_are_removed() {
        let temp = TempDir::new().unwrap();
        let docs = temp.path().join("docs/contracts/contracts");
        let old = sample_artifact("contracts/Old.sol", "Old");
        let vault = sample_artifact("contracts/Vault.sol", "Vault");
        write_atomic(&docs.join("Old.md"), render_unit(&old).as_bytes()).unwrap();
        write_atomic(&docs.join("Vault.md"), render_unit(&vault).as_bytes()).unwrap();
        write_atomic(&docs.join("NOTES.md"), b"hand written").unwrap();

        // Vault failed to compile this time, Old.sol was deleted
        let source = "pragma solidity ^0.8.0;\n";
        let units = vec![
            SourceUnit::new("contracts/Token.sol", source).unwrap(),
            SourceUnit::new("contracts/Vault.sol", source).unwrap(),
        ];
        let artifacts = ArtifactSet::new();
        artifacts.insert(sample_artifact("contracts/Token.sol", "Token"));
        let ctx = ProcessContext {
            project_root: temp.path(),
            units: &units,
            artifacts: &artifacts,
        };

        generator(temp.path(), false, &[]).process(&ctx).unwrap();
        assert!(docs.join("Token.md").exists());
        assert!(docs.join("Vault.md").exists());
        assert!(docs.join("NOTES.md").exists());
        assert!(!docs.join("Old.md").exists());

        generator(temp.path(), true, &[]).process(&ctx).unwrap();
        assert!(docs.join("Vault.md").exists());
        assert!(!docs.join("NOTES.md").exists());
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let result = DocumentationGenerator::new(
            "docgen".into(),
            DocgenConfig {
                name: None,
                order: 30,
                run_on_build: false,
                path: PathBuf::from("docs"),
                clear: false,
                except: vec!["([".into()],
            },
            Path::new("."),
        );
        assert!(result.is_err());
    }
}
