//! Coverage instrumentation maps
//!
//! For every deployed contract, decodes the runtime bytecode into
//! instructions and pairs each instruction with its entry in the compiler's
//! compressed source map. A coverage runner can then translate executed
//! program counters into source ranges.

use super::{resolve_dir, PostProcessor, ProcessContext};
use crate::artifacts::{writer, BuildArtifact, CompiledContract};
use crate::blockchain::strip_metadata;
use crate::utils::write_atomic;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_order")]
    pub order: i32,
    #[serde(default)]
    pub run_on_build: bool,
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
}

fn default_order() -> i32 {
    40
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("coverage")
}

#[derive(Debug)]
pub struct CoverageInstrumenter {
    name: String,
    order: i32,
    run_on_build: bool,
    out_dir: PathBuf,
}

impl CoverageInstrumenter {
    pub fn new(name: String, config: CoverageConfig, project_root: &Path) -> Self {
        Self {
            name,
            order: config.order,
            run_on_build: config.run_on_build,
            out_dir: resolve_dir(project_root, &config.out_dir),
        }
    }
}

impl PostProcessor for CoverageInstrumenter {
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
        &self.out_dir
    }

    fn requires_unoptimized(&self) -> bool {
        true
    }

    fn process(&self, ctx: &ProcessContext<'_>) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for artifact in ctx.artifacts.snapshot() {
            for contract in artifact.contracts.values() {
                let Some(map) = instrument(&artifact, contract)? else {
                    continue;
                };
                let path = writer::artifact_path(&self.out_dir, &artifact.unit, &contract.name);
                let mut json = serde_json::to_vec_pretty(&map)?;
                json.push(b'\n');
                write_atomic(&path, &json)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                written.push(path);
            }
        }

        let keep: BTreeSet<PathBuf> = written.iter().cloned().collect();
        let preserve: Vec<PathBuf> = ctx
            .retained_units()
            .into_iter()
            .map(|unit| writer::unit_dir(&self.out_dir, unit))
            .collect();
        writer::reconcile(&self.out_dir, &keep, &preserve)?;
        Ok(written)
    }
}

/// Program counter to source range map for one contract
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageMap {
    pub contract: String,
    pub unit: String,
    pub compiler_version: String,
    pub sources: BTreeMap<u32, String>,
    pub instructions: Vec<InstrumentedInstruction>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentedInstruction {
    pub pc: usize,
    pub opcode: Cow<'static, str>,
    pub start: i64,
    pub length: i64,
    /// Index into `sources`, absent for compiler-generated code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<u32>,
    pub jump: Jump,
    pub modifier_depth: u32,
}

/// Jump annotation of a source map entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Jump {
    #[serde(rename = "i")]
    Into,
    #[serde(rename = "o")]
    Out,
    #[serde(rename = "-")]
    Regular,
}

/// Build the map for one contract, `None` when there is nothing to map
pub fn instrument(artifact: &BuildArtifact, contract: &CompiledContract) -> Result<Option<CoverageMap>> {
    let Some(source_map) = contract.deployed_source_map.as_deref() else {
        return Ok(None);
    };
    if contract.deployed_bytecode.is_empty() {
        return Ok(None);
    }
    if !contract.deployed_bytecode.is_linked() {
        tracing::warn!(
            "Skipping coverage for {} in {}: bytecode has unlinked libraries",
            contract.name,
            artifact.unit
        );
        return Ok(None);
    }

    let code = contract
        .deployed_bytecode
        .to_bytes()
        .with_context(|| format!("Invalid runtime bytecode for {}", contract.name))?;
    let instructions = decode_instructions(strip_metadata(&code));
    let entries = decompress_source_map(source_map)
        .with_context(|| format!("Invalid source map for {}", contract.name))?;

    if entries.len() != instructions.len() {
        tracing::debug!(
            "{}: {} instructions but {} source map entries",
            contract.name,
            instructions.len(),
            entries.len()
        );
    }

    let instructions = instructions
        .into_iter()
        .zip(entries)
        .map(|((pc, op), entry)| InstrumentedInstruction {
            pc,
            opcode: opcode_name(op),
            start: entry.start,
            length: entry.length,
            source: u32::try_from(entry.file).ok(),
            jump: entry.jump,
            modifier_depth: entry.modifier_depth,
        })
        .collect();

    Ok(Some(CoverageMap {
        contract: contract.name.clone(),
        unit: artifact.unit.clone(),
        compiler_version: artifact.compiler_version.to_string(),
        sources: artifact.source_ids.clone(),
        instructions,
    }))
}

/// `(pc, opcode)` pairs, skipping push immediates
pub fn decode_instructions(code: &[u8]) -> Vec<(usize, u8)> {
    let mut instructions = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let op = code[pc];
        instructions.push((pc, op));
        pc += 1 + push_size(op);
    }
    instructions
}

fn push_size(op: u8) -> usize {
    match op {
        0x60..=0x7f => (op - 0x5f) as usize,
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMapEntry {
    pub start: i64,
    pub length: i64,
    pub file: i64,
    pub jump: Jump,
    pub modifier_depth: u32,
}

/// Expand solc's compressed `s:l:f:j:m;...` source map
///
/// Empty or missing fields repeat the value of the previous entry.
pub fn decompress_source_map(map: &str) -> Result<Vec<SourceMapEntry>> {
    let mut current = SourceMapEntry {
        start: 0,
        length: 0,
        file: -1,
        jump: Jump::Regular,
        modifier_depth: 0,
    };

    let mut entries = Vec::new();
    if map.is_empty() {
        return Ok(entries);
    }

    for (i, item) in map.split(';').enumerate() {
        for (field, value) in item.split(':').enumerate() {
            if value.is_empty() {
                continue;
            }
            let parse = || {
                value
                    .parse::<i64>()
                    .with_context(|| format!("entry {i}: bad field '{value}'"))
            };
            match field {
                0 => current.start = parse()?,
                1 => current.length = parse()?,
                2 => current.file = parse()?,
                3 => {
                    current.jump = match value {
                        "i" => Jump::Into,
                        "o" => Jump::Out,
                        "-" => Jump::Regular,
                        other => eyre::bail!("entry {i}: unknown jump type '{other}'"),
                    }
                }
                4 => current.modifier_depth = parse()?.try_into().unwrap_or(0),
                _ => {}
            }
        }
        entries.push(current);
    }
    Ok(entries)
}

/// Mnemonic for an opcode byte
pub fn opcode_name(op: u8) -> Cow<'static, str> {
    let name = match op {
        0x00 => "STOP",
        0x01 => "ADD",
        0x02 => "MUL",
        0x03 => "SUB",
        0x04 => "DIV",
        0x05 => "SDIV",
        0x06 => "MOD",
        0x07 => "SMOD",
        0x08 => "ADDMOD",
        0x09 => "MULMOD",
        0x0a => "EXP",
        0x0b => "SIGNEXTEND",
        0x10 => "LT",
        0x11 => "GT",
        0x12 => "SLT",
        0x13 => "SGT",
        0x14 => "EQ",
        0x15 => "ISZERO",
        0x16 => "AND",
        0x17 => "OR",
        0x18 => "XOR",
        0x19 => "NOT",
        0x1a => "BYTE",
        0x1b => "SHL",
        0x1c => "SHR",
        0x1d => "SAR",
        0x20 => "KECCAK256",
        0x30 => "ADDRESS",
        0x31 => "BALANCE",
        0x32 => "ORIGIN",
        0x33 => "CALLER",
        0x34 => "CALLVALUE",
        0x35 => "CALLDATALOAD",
        0x36 => "CALLDATASIZE",
        0x37 => "CALLDATACOPY",
        0x38 => "CODESIZE",
        0x39 => "CODECOPY",
        0x3a => "GASPRICE",
        0x3b => "EXTCODESIZE",
        0x3c => "EXTCODECOPY",
        0x3d => "RETURNDATASIZE",
        0x3e => "RETURNDATACOPY",
        0x3f => "EXTCODEHASH",
        0x40 => "BLOCKHASH",
        0x41 => "COINBASE",
        0x42 => "TIMESTAMP",
        0x43 => "NUMBER",
        0x44 => "PREVRANDAO",
        0x45 => "GASLIMIT",
        0x46 => "CHAINID",
        0x47 => "SELFBALANCE",
        0x48 => "BASEFEE",
        0x49 => "BLOBHASH",
        0x4a => "BLOBBASEFEE",
        0x50 => "POP",
        0x51 => "MLOAD",
        0x52 => "MSTORE",
        0x53 => "MSTORE8",
        0x54 => "SLOAD",
        0x55 => "SSTORE",
        0x56 => "JUMP",
        0x57 => "JUMPI",
        0x58 => "PC",
        0x59 => "MSIZE",
        0x5a => "GAS",
        0x5b => "JUMPDEST",
        0x5c => "TLOAD",
        0x5d => "TSTORE",
        0x5e => "MCOPY",
        0x5f => "PUSH0",
        0x60..=0x7f => return Cow::Owned(format!("PUSH{}", op - 0x5f)),
        0x80..=0x8f => return Cow::Owned(format!("DUP{}", op - 0x7f)),
        0x90..=0x9f => return Cow::Owned(format!("SWAP{}", op - 0x8f)),
        0xa0..=0xa4 => return Cow::Owned(format!("LOG{}", op - 0xa0)),
        0xf0 => "CREATE",
        0xf1 => "CALL",
        0xf2 => "CALLCODE",
        0xf3 => "RETURN",
        0xf4 => "DELEGATECALL",
        0xf5 => "CREATE2",
        0xfa => "STATICCALL",
        0xfd => "REVERT",
        0xfe => "INVALID",
        0xff => "SELFDESTRUCT",
        _ => return Cow::Owned(format!("UNKNOWN_0x{op:02x}")),
    };
    Cow::Borrowed(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::test_support::sample_artifact;
    use crate::artifacts::{ArtifactSet, Bytecode};
    use crate::source::SourceUnit;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_decode_skips_push_data() {
        // PUSH1 0x80 PUSH2 0x0102 JUMPDEST STOP
        let code = [0x60, 0x80, 0x61, 0x01, 0x02, 0x5b, 0x00];
        assert_eq!(
            decode_instructions(&code),
            vec![(0, 0x60), (2, 0x61), (5, 0x5b), (6, 0x00)]
        );

        // truncated push at the end still yields the instruction
        assert_eq!(decode_instructions(&[0x62, 0x01]), vec![(0, 0x62)]);
    }

    #[test]
    fn test_decompress_inherits_fields() {
        let entries = decompress_source_map("1:2:0:-:0;;3;:4:1:i;::-1:o").unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!((entries[1].start, entries[1].length, entries[1].file), (1, 2, 0));
        assert_eq!((entries[2].start, entries[2].length), (3, 2));
        assert_eq!(
            (entries[3].start, entries[3].length, entries[3].file, entries[3].jump),
            (3, 4, 1, Jump::Into)
        );
        assert_eq!((entries[4].file, entries[4].jump), (-1, Jump::Out));

        assert!(decompress_source_map("1:2:x").is_err());
        assert!(decompress_source_map("").unwrap().is_empty());
    }

    #[test]
    fn test_opcode_names() {
        assert_eq!(opcode_name(0x60), "PUSH1");
        assert_eq!(opcode_name(0x7f), "PUSH32");
        assert_eq!(opcode_name(0x80), "DUP1");
        assert_eq!(opcode_name(0x9f), "SWAP16");
        assert_eq!(opcode_name(0xa2), "LOG2");
        assert_eq!(opcode_name(0xfd), "REVERT");
        assert_eq!(opcode_name(0x0c), "UNKNOWN_0x0c");
    }

    #[test]
    fn test_instrument_sample_contract() {
        let artifact = sample_artifact("contracts/Token.sol", "Token");
        let contract = &artifact.contracts["Token"];

        let map = instrument(&artifact, contract).unwrap().unwrap();
        assert_eq!(map.instructions.len(), 7);
        assert_eq!(map.sources[&0], "contracts/Token.sol");

        let first = &map.instructions[0];
        assert_eq!((first.pc, &*first.opcode), (0, "PUSH1"));
        assert_eq!((first.start, first.length, first.source), (25, 40, Some(0)));

        let last = map.instructions.last().unwrap();
        assert_eq!((last.pc, &*last.opcode, last.start), (9, "STOP", 25));
    }

    #[test]
    fn test_unlinked_code_is_skipped() {
        let mut artifact = sample_artifact("contracts/Token.sol", "Token");
        let contract = artifact.contracts.get_mut("Token").unwrap();
        contract.deployed_bytecode = Bytecode::from_hex("73__$abc$__63");
        let contract = artifact.contracts["Token"].clone();
        assert!(instrument(&artifact, &contract).unwrap().is_none());
    }

    #[test]
    fn test_process_writes_per_contract_maps() {
        let temp = TempDir::new().unwrap();
        let artifacts = ArtifactSet::new();
        artifacts.insert(sample_artifact("contracts/Token.sol", "Token"));
        let ctx = ProcessContext {
            project_root: temp.path(),
            units: &[],
            artifacts: &artifacts,
        };

        let instrumenter = CoverageInstrumenter::new(
            "coverage".into(),
            CoverageConfig {
                name: None,
                order: 40,
                run_on_build: false,
                out_dir: PathBuf::from("coverage"),
            },
            temp.path(),
        );
        assert!(instrumenter.requires_unoptimized());

        let written = instrumenter.process(&ctx).unwrap();
        assert_eq!(
            written,
            vec![temp.path().join("coverage/contracts/Token.sol/Token.json")]
        );
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&written[0]).unwrap()).unwrap();
        assert_eq!(json["instructions"][0]["jump"], "-");
        assert_eq!(json["compilerVersion"], "0.8.2");
    }

    #[test]
    fn test_failed_units_keep_their_maps() {
        let temp = TempDir::new().unwrap();
        let broken = temp.path().join("coverage/contracts/Vault.sol/Vault.json");
        let removed = temp.path().join("coverage/contracts/Old.sol/Old.json");
        write_atomic(&broken, b"{}").unwrap();
        write_atomic(&removed, b"{}").unwrap();

        let units = vec![
            SourceUnit::new("contracts/Token.sol", "pragma solidity ^0.8.0;\n").unwrap(),
            SourceUnit::new("contracts/Vault.sol", "pragma solidity ^0.8.0;\n").unwrap(),
        ];
        let artifacts = ArtifactSet::new();
        artifacts.insert(sample_artifact("contracts/Token.sol", "Token"));
        let ctx = ProcessContext {
            project_root: temp.path(),
            units: &units,
            artifacts: &artifacts,
        };

        let instrumenter = CoverageInstrumenter::new(
            "coverage".into(),
            CoverageConfig {
                name: None,
                order: 40,
                run_on_build: false,
                out_dir: PathBuf::from("coverage"),
            },
            temp.path(),
        );
        instrumenter.process(&ctx).unwrap();

        assert!(temp.path().join("coverage/contracts/Token.sol/Token.json").exists());
        assert!(broken.exists());
        assert!(!removed.exists());
        assert!(!temp.path().join("coverage/contracts/Old.sol").exists());
    }
}
