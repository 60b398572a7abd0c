//! Debug metadata stored next to every compiled contract
//!
//! The JSON produced here lands in artifact files and must stay stable
//! between builds of unchanged sources: no timestamps, ordered maps only.

use super::{abi, Abi, Bytecode};
use crate::registry::{CompilerProfile, OptimizerSettings};
use crate::utils::hash_bytes;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactMetadata {
    pub schema_version: u32,
    pub compiler: CompilerInfo,
    pub source_hash: String,
    pub bytecode: BytecodeInfo,
    pub deployed_bytecode: BytecodeInfo,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub function_selectors: BTreeMap<String, String>,
    /// The compiler's own metadata document, parsed when possible
    #[serde(skip_serializing_if = "Value::is_null")]
    pub solc_metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompilerInfo {
    pub version: String,
    pub optimizer: OptimizerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BytecodeInfo {
    pub hash: String,
    pub size: usize,
    pub linked: bool,
}

impl BytecodeInfo {
    fn of(code: &Bytecode) -> Self {
        // Unlinked code is not valid hex yet, hash its text instead
        let hash = match code.to_bytes() {
            Ok(bytes) => hash_bytes(&bytes),
            Err(_) => hash_bytes(code.as_hex().as_bytes()),
        };
        Self {
            hash: format!("sha256:{hash}"),
            size: code.size(),
            linked: code.is_linked(),
        }
    }
}

/// Build the metadata record for one contract
pub fn create(
    profile: &CompilerProfile,
    source: &str,
    bytecode: &Bytecode,
    deployed_bytecode: &Bytecode,
    abi: &Abi,
    solc_metadata: &str,
) -> ArtifactMetadata {
    let solc_metadata = if solc_metadata.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(solc_metadata).unwrap_or_else(|_| Value::String(solc_metadata.into()))
    };

    ArtifactMetadata {
        schema_version: SCHEMA_VERSION,
        compiler: CompilerInfo {
            version: profile.version.to_string(),
            optimizer: profile.optimizer.clone(),
        },
        source_hash: format!("sha256:{}", hash_bytes(source.as_bytes())),
        bytecode: BytecodeInfo::of(bytecode),
        deployed_bytecode: BytecodeInfo::of(deployed_bytecode),
        function_selectors: abi::function_selectors(abi),
        solc_metadata,
    }
}
