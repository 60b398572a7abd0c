//! Artifact writing and output-directory reconciliation

use super::{BuildArtifact, Bytecode, CompiledContract};
use crate::error::{BuildError, BuildResult};
use crate::utils::write_atomic;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const ARTIFACT_FORMAT: &str = "contract-builder-artifact-1";

/// On-disk shape of one contract artifact
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactFile<'a> {
    #[serde(rename = "_format")]
    format: &'static str,
    contract_name: &'a str,
    source_name: &'a str,
    abi: &'a [Value],
    bytecode: &'a Bytecode,
    deployed_bytecode: &'a Bytecode,
    #[serde(skip_serializing_if = "Option::is_none")]
    deployed_source_map: Option<&'a str>,
    #[serde(skip_serializing_if = "is_null")]
    devdoc: &'a Value,
    #[serde(skip_serializing_if = "is_null")]
    userdoc: &'a Value,
    metadata: &'a super::ArtifactMetadata,
}

fn is_null(value: &&Value) -> bool {
    value.is_null()
}

/// Directory holding the artifacts of `unit`
///
/// ```ignore
/// artifacts/
///   contracts/Token.sol/
///     Token.json
///     TokenLib.json
/// ```
pub fn unit_dir(root: &Path, unit: &str) -> PathBuf {
    unit.split('/').fold(root.to_path_buf(), |dir, part| dir.join(part))
}

pub fn artifact_path(root: &Path, unit: &str, contract: &str) -> PathBuf {
    unit_dir(root, unit).join(format!("{contract}.json"))
}

/// Serialize one contract artifact
pub fn render(unit: &str, contract: &CompiledContract) -> BuildResult<Vec<u8>> {
    let file = ArtifactFile {
        format: ARTIFACT_FORMAT,
        contract_name: &contract.name,
        source_name: unit,
        abi: &contract.abi,
        bytecode: &contract.bytecode,
        deployed_bytecode: &contract.deployed_bytecode,
        deployed_source_map: contract.deployed_source_map.as_deref(),
        devdoc: &contract.devdoc,
        userdoc: &contract.userdoc,
        metadata: &contract.metadata,
    };

    let mut json = serde_json::to_vec_pretty(&file).map_err(|e| {
        BuildError::io(
            unit,
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })?;
    json.push(b'\n');
    Ok(json)
}

/// Write every contract of `artifact` below `root`, returning the paths written
pub fn write_artifact(root: &Path, artifact: &BuildArtifact) -> BuildResult<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(artifact.contracts.len());
    for contract in artifact.contracts.values() {
        let path = artifact_path(root, &artifact.unit, &contract.name);
        let json = render(&artifact.unit, contract)?;
        write_atomic(&path, &json).map_err(|e| BuildError::io(&path, e))?;
        tracing::debug!("Saved artifact to: {}", path.display());
        written.push(path);
    }
    Ok(written)
}

/// Remove files below `root` that this build did not produce
///
/// Files in `keep` survive, as does anything below a directory in
/// `preserve` (used for units whose compilation failed, so their previous
/// artifacts stay until the unit builds again). Empty directories are
/// pruned afterwards. Returns the removed files.
pub fn reconcile(
    root: &Path,
    keep: &BTreeSet<PathBuf>,
    preserve: &[PathBuf],
) -> BuildResult<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut removed = Vec::new();
    for entry in WalkDir::new(root)
        .contents_first(true)
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if entry.file_type().is_dir() {
            if path != root && is_empty_dir(path) {
                std::fs::remove_dir(path).map_err(|e| BuildError::io(path, e))?;
            }
            continue;
        }

        if keep.contains(path) || preserve.iter().any(|dir| path.starts_with(dir)) {
            continue;
        }

        std::fs::remove_file(path).map_err(|e| BuildError::io(path, e))?;
        tracing::debug!("Removed stale output: {}", path.display());
        removed.push(path.to_path_buf());
    }

    Ok(removed)
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::test_support::sample_artifact;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_write_artifact_layout() {
        let temp = TempDir::new().unwrap();
        let artifact = sample_artifact("contracts/Token.sol", "Token");

        let written = write_artifact(temp.path(), &artifact).unwrap();
        assert_eq!(written, vec![temp.path().join("contracts/Token.sol/Token.json")]);

        let json: Value = serde_json::from_slice(&fs::read(&written[0]).unwrap()).unwrap();
        assert_eq!(json["_format"], ARTIFACT_FORMAT);
        assert_eq!(json["contractName"], "Token");
        assert_eq!(json["sourceName"], "contracts/Token.sol");
        assert_eq!(json["deployedBytecode"], "0x6080604052600080fd00");
        assert_eq!(json["metadata"]["compiler"]["version"], "0.8.2");
    }

    #[test]
    fn test_rewrite_is_byte_identical() {
        let temp = TempDir::new().unwrap();
        let artifact = sample_artifact("contracts/Token.sol", "Token");

        let path = write_artifact(temp.path(), &artifact).unwrap().remove(0);
        let first = fs::read(&path).unwrap();
        write_artifact(temp.path(), &artifact).unwrap();
        assert_eq!(first, fs::read(&path).unwrap());
    }

    #[test]
    fn test_reconcile_removes_stale_units() {
        let temp = TempDir::new().unwrap();
        let kept = write_artifact(temp.path(), &sample_artifact("contracts/A.sol", "A")).unwrap();
        write_artifact(temp.path(), &sample_artifact("contracts/Old.sol", "Old")).unwrap();
        let failed = write_artifact(temp.path(), &sample_artifact("contracts/Broken.sol", "Broken")).unwrap();

        let keep: BTreeSet<_> = kept.iter().cloned().collect();
        let preserve = vec![unit_dir(temp.path(), "contracts/Broken.sol")];
        let removed = reconcile(temp.path(), &keep, &preserve).unwrap();

        assert_eq!(removed, vec![temp.path().join("contracts/Old.sol/Old.json")]);
        assert!(!temp.path().join("contracts/Old.sol").exists());
        assert!(kept[0].exists());
        assert!(failed[0].exists());
    }

    #[test]
    fn test_reconcile_missing_root() {
        let temp = TempDir::new().unwrap();
        let removed = reconcile(&temp.path().join("nothing"), &BTreeSet::new(), &[]).unwrap();
        assert!(removed.is_empty());
    }
}
