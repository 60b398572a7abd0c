//! Build artifacts and the shared artifact set

use crate::compiler::{ContractOutput, Diagnostic};
use crate::registry::CompilerProfile;
use crate::source::SourceUnit;
use semver::Version;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

pub mod abi;
pub mod metadata;
pub mod writer;

pub use abi::Abi;
pub use metadata::ArtifactMetadata;

/// Hex-encoded EVM bytecode
///
/// Kept as text because unlinked library references (`__$...$__`) are not
/// valid hex until linked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bytecode(String);

impl Bytecode {
    pub fn from_hex(object: &str) -> Self {
        let object = object.strip_prefix("0x").unwrap_or(object);
        Self(object.to_ascii_lowercase())
    }

    /// Hex digits without `0x`
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every library placeholder has been resolved
    pub fn is_linked(&self) -> bool {
        !self.0.contains("__")
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.0.len() / 2
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.0)
    }
}

impl Serialize for Bytecode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", self.0))
    }
}

/// Compiled output for one contract inside a source unit
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledContract {
    pub name: String,
    pub abi: Abi,
    pub bytecode: Bytecode,
    pub deployed_bytecode: Bytecode,
    pub deployed_source_map: Option<String>,
    pub devdoc: Value,
    pub userdoc: Value,
    pub metadata: ArtifactMetadata,
}

impl CompiledContract {
    pub fn from_output(
        name: &str,
        output: ContractOutput,
        unit: &SourceUnit,
        profile: &CompilerProfile,
    ) -> Self {
        let bytecode = Bytecode::from_hex(&output.evm.bytecode.object);
        let deployed_bytecode = Bytecode::from_hex(&output.evm.deployed_bytecode.object);
        let metadata = metadata::create(
            profile,
            &unit.content,
            &bytecode,
            &deployed_bytecode,
            &output.abi,
            &output.metadata,
        );

        Self {
            name: name.to_string(),
            abi: output.abi,
            bytecode,
            deployed_bytecode,
            deployed_source_map: output.evm.deployed_bytecode.source_map,
            devdoc: output.devdoc,
            userdoc: output.userdoc,
            metadata,
        }
    }

    /// Interfaces and abstract contracts compile to empty bytecode
    pub fn is_deployable(&self) -> bool {
        !self.bytecode.is_empty()
    }
}

/// Everything the compiler produced for one source unit
#[derive(Debug, Clone, PartialEq)]
pub struct BuildArtifact {
    pub unit: String,
    pub compiler_version: Version,
    pub contracts: BTreeMap<String, CompiledContract>,
    /// Source id table of the invocation, needed to read source maps
    pub source_ids: BTreeMap<u32, String>,
    /// Non-fatal diagnostics (warnings, infos) attributed to this unit
    pub diagnostics: Vec<Diagnostic>,
}

/// A file produced by a post-processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedOutput {
    pub processor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub path: PathBuf,
}

/// Artifacts of one build invocation
///
/// Append-only: artifacts are inserted once per unit and never replaced or
/// removed, so concurrent writers keyed by distinct units never conflict.
/// Post-processors read artifacts and append records of what they generated.
#[derive(Debug, Default)]
pub struct ArtifactSet {
    artifacts: RwLock<BTreeMap<String, Arc<BuildArtifact>>>,
    outputs: Mutex<Vec<GeneratedOutput>>,
    warnings: Mutex<Vec<String>>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an artifact; returns false if the unit already has one
    pub fn insert(&self, artifact: BuildArtifact) -> bool {
        let mut artifacts = self
            .artifacts
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if artifacts.contains_key(&artifact.unit) {
            return false;
        }
        artifacts.insert(artifact.unit.clone(), Arc::new(artifact));
        true
    }

    pub fn get(&self, unit: &str) -> Option<Arc<BuildArtifact>> {
        self.artifacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(unit)
            .cloned()
    }

    /// All artifacts ordered by unit identifier
    pub fn snapshot(&self) -> Vec<Arc<BuildArtifact>> {
        self.artifacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.artifacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record_output(&self, output: GeneratedOutput) {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(output);
    }

    /// Note a problem worth surfacing in the build report
    pub fn record_warning(&self, warning: impl Into<String>) {
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(warning.into());
    }

    /// Warnings recorded so far, sorted
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = self
            .warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        warnings.sort();
        warnings
    }

    /// Generated outputs recorded so far, in a stable order
    pub fn outputs(&self) -> Vec<GeneratedOutput> {
        let mut outputs = self
            .outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        outputs.sort_by(|a, b| (&a.processor, &a.path).cmp(&(&b.processor, &b.path)));
        outputs
    }
}
