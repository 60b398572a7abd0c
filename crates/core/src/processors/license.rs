//! SPDX license header stamping

use super::{PostProcessor, ProcessContext};
use crate::utils::write_atomic;
use eyre::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static SPDX_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*//[ \t]*SPDX-License-Identifier:[ \t]*(.*?)[ \t]*(\r?)$")
        .expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LicenseConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub order: i32,
    #[serde(default = "default_run_on_build")]
    pub run_on_build: bool,
    /// SPDX identifier to stamp
    #[serde(default = "default_license")]
    pub license: String,
    /// Replace a different identifier already present in a source
    #[serde(default)]
    pub overwrite: bool,
}

fn default_run_on_build() -> bool {
    true
}

fn default_license() -> String {
    "MIT".to_string()
}

#[derive(Debug)]
pub struct LicenseHeaderInjector {
    name: String,
    order: i32,
    run_on_build: bool,
    sources_dir: PathBuf,
    license: String,
    overwrite: bool,
}

impl LicenseHeaderInjector {
    pub fn new(name: String, config: LicenseConfig, sources_dir: &Path) -> Self {
        Self {
            name,
            order: config.order,
            run_on_build: config.run_on_build,
            sources_dir: sources_dir.to_path_buf(),
            license: config.license,
            overwrite: config.overwrite,
        }
    }
}

impl PostProcessor for LicenseHeaderInjector {
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
        &self.sources_dir
    }

    fn edits_sources(&self) -> bool {
        true
    }

    fn process(&self, ctx: &ProcessContext<'_>) -> Result<Vec<PathBuf>> {
        let mut changed = Vec::new();
        for unit in ctx.units {
            let path = unit.path_in(ctx.project_root);
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;

            if let Cow::Owned(stamped) = stamp(&content, &self.license, self.overwrite) {
                write_atomic(&path, stamped.as_bytes())
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                tracing::debug!("Stamped {} with {}", unit.id, self.license);
                changed.push(path);
            }
        }
        Ok(changed)
    }
}

/// Stamp `license` onto a source
///
/// Sources without an identifier get one as their first line. An existing
/// identifier is kept unless `overwrite` is set and it differs. Returns
/// `Cow::Borrowed` when nothing changes, so stamping is idempotent.
pub fn stamp<'a>(content: &'a str, license: &str, overwrite: bool) -> Cow<'a, str> {
    let Some(existing) = SPDX_LINE.captures(content) else {
        return Cow::Owned(format!("// SPDX-License-Identifier: {license}\n{content}"));
    };

    let (line, current) = match (existing.get(0), existing.get(1)) {
        (Some(line), Some(current)) => (line, current.as_str()),
        _ => return Cow::Borrowed(content),
    };
    if current == license.trim() || !overwrite {
        return Cow::Borrowed(content);
    }

    let mut out = String::with_capacity(content.len() + license.len());
    out.push_str(&content[..line.start()]);
    out.push_str(&format!("// SPDX-License-Identifier: {license}"));
    out.push_str(existing.get(2).map_or("", |cr| cr.as_str()));
    out.push_str(&content[line.end()..]);
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactSet;
    use crate::source::SourceUnit;
    use tempfile::TempDir;

    const SOURCE: &str = "pragma solidity ^0.8.0;\n\ncontract A {}\n";

    #[test]
    fn test_stamp_missing_header() {
        let stamped = stamp(SOURCE, "MIT", false);
        assert_eq!(
            stamped,
            "// SPDX-License-Identifier: MIT\npragma solidity ^0.8.0;\n\ncontract A {}\n"
        );
    }

    #[test]
    fn test_stamp_twice_equals_once() {
        let once = stamp(SOURCE, "MIT", true).into_owned();
        let twice = stamp(&once, "MIT", true);
        assert!(matches!(twice, Cow::Borrowed(_)));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_existing_identifier() {
        let gpl = "// SPDX-License-Identifier: GPL-3.0\npragma solidity ^0.8.0;\n";

        assert!(matches!(stamp(gpl, "MIT", false), Cow::Borrowed(_)));
        assert_eq!(
            stamp(gpl, "MIT", true),
            "// SPDX-License-Identifier: MIT\npragma solidity ^0.8.0;\n"
        );

        // identifiers below a leading comment block are found too
        let later = "/* Vault */\n// SPDX-License-Identifier: UNLICENSED\ncontract V {}\n";
        assert_eq!(
            stamp(later, "MIT", true),
            "/* Vault */\n// SPDX-License-Identifier: MIT\ncontract V {}\n"
        );
    }

    #[test]
    fn test_compound_expressions() {
        let once = stamp(SOURCE, "MIT OR Apache-2.0", false).into_owned();
        let twice = stamp(&once, "MIT OR Apache-2.0", false);
        assert!(matches!(twice, Cow::Borrowed(_)));
        assert_eq!(once.matches("SPDX-License-Identifier").count(), 1);

        let dual = "// SPDX-License-Identifier: GPL-2.0-or-later OR MIT \r\ncontract D {}\n";
        assert!(matches!(stamp(dual, "MIT", false), Cow::Borrowed(_)));
        assert!(matches!(stamp(dual, "GPL-2.0-or-later OR MIT", true), Cow::Borrowed(_)));
        assert_eq!(
            stamp(dual, "MIT", true),
            "// SPDX-License-Identifier: MIT\r\ncontract D {}\n"
        );
    }

    #[test]
    fn test_process_only_touches_changed_files() {
        let temp = TempDir::new().unwrap();
        let contracts = temp.path().join("contracts");
        std::fs::create_dir_all(&contracts).unwrap();
        std::fs::write(contracts.join("A.sol"), SOURCE).unwrap();
        std::fs::write(
            contracts.join("B.sol"),
            format!("// SPDX-License-Identifier: MIT\n{SOURCE}"),
        )
        .unwrap();

        let units = vec![
            SourceUnit::new("contracts/A.sol", SOURCE).unwrap(),
            SourceUnit::new("contracts/B.sol", SOURCE).unwrap(),
        ];
        let artifacts = ArtifactSet::new();
        let ctx = ProcessContext {
            project_root: temp.path(),
            units: &units,
            artifacts: &artifacts,
        };
        let injector = LicenseHeaderInjector::new(
            "license".into(),
            LicenseConfig {
                name: None,
                order: 0,
                run_on_build: true,
                license: "MIT".into(),
                overwrite: true,
            },
            &contracts,
        );

        let changed = injector.process(&ctx).unwrap();
        assert_eq!(changed, vec![contracts.join("A.sol")]);
        assert!(injector.process(&ctx).unwrap().is_empty());
    }
}
