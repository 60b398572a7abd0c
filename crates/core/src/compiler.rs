//! Compiler invocation through solc's standard JSON interface

use crate::cancel::CancelHandle;
use crate::registry::CompilerProfile;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;

/// Outputs requested from the compiler for every contract
pub const OUTPUT_SELECTION: &[&str] = &[
    "abi",
    "evm.bytecode.object",
    "evm.deployedBytecode.object",
    "evm.deployedBytecode.sourceMap",
    "metadata",
    "devdoc",
    "userdoc",
];

/// Sources handed to one compiler invocation, keyed by unit identifier
#[derive(Debug, Clone, Default)]
pub struct CompilerInput {
    pub sources: BTreeMap<String, String>,
}

impl CompilerInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, id: impl Into<String>, content: impl Into<String>) -> Self {
        self.sources.insert(id.into(), content.into());
        self
    }

    /// Standard JSON input document for `profile`
    pub fn to_standard_json(&self, profile: &CompilerProfile) -> Value {
        let sources: serde_json::Map<String, Value> = self
            .sources
            .iter()
            .map(|(id, content)| (id.clone(), json!({ "content": content })))
            .collect();

        let mut settings = profile.settings_json();
        settings.insert(
            "outputSelection".into(),
            json!({ "*": { "*": OUTPUT_SELECTION } }),
        );

        json!({
            "language": "Solidity",
            "sources": sources,
            "settings": settings,
        })
    }
}

/// Diagnostic severity as reported by the compiler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub start: i64,
    pub end: i64,
}

/// A structured compiler message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub severity: Severity,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_location: Option<SourceLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl Diagnostic {
    /// Error that is not tied to a source location (crashes, missing binary)
    pub fn tool_error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            kind: "ToolError".to_string(),
            message: message.into(),
            formatted_message: None,
            source_location: None,
            error_code: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Source file the diagnostic points at, if any
    pub fn file(&self) -> Option<&str> {
        self.source_location.as_ref().map(|l| l.file.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BytecodeOutput {
    #[serde(default)]
    pub object: String,
    #[serde(default, rename = "sourceMap")]
    pub source_map: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvmOutput {
    #[serde(default)]
    pub bytecode: BytecodeOutput,
    #[serde(default, rename = "deployedBytecode")]
    pub deployed_bytecode: BytecodeOutput,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContractOutput {
    #[serde(default)]
    pub abi: Vec<Value>,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub devdoc: Value,
    #[serde(default)]
    pub userdoc: Value,
    #[serde(default)]
    pub evm: EvmOutput,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceOutput {
    pub id: u32,
}

/// Standard JSON output document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompilerOutput {
    #[serde(default)]
    pub errors: Vec<Diagnostic>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceOutput>,
    #[serde(default)]
    pub contracts: BTreeMap<String, BTreeMap<String, ContractOutput>>,
}

impl CompilerOutput {
    pub fn has_errors(&self) -> bool {
        self.errors.iter().any(Diagnostic::is_error)
    }

    /// Source id table used by source maps (`id -> unit`)
    pub fn source_ids(&self) -> BTreeMap<u32, String> {
        self.sources
            .iter()
            .map(|(name, source)| (source.id, name.clone()))
            .collect()
    }
}

/// Failure to run the compiler at all, as opposed to compile errors in sources
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("compiler invocation cancelled")]
    Cancelled,

    #[error("failed to start {binary}: {error}")]
    Spawn {
        binary: PathBuf,
        error: std::io::Error,
    },

    #[error("compiler exited with status {status:?}: {stderr}")]
    Failed { status: Option<i32>, stderr: String },

    #[error("unreadable compiler output: {0}")]
    InvalidOutput(String),
}

/// Something that turns a set of sources into compiler output for one profile
///
/// Implementations must be usable from several worker threads at once: the
/// build pipeline runs one invocation per compiler version in parallel.
pub trait CompilerBackend: Send + Sync {
    fn compile(
        &self,
        profile: &CompilerProfile,
        input: &CompilerInput,
        cancel: &CancelHandle,
    ) -> Result<CompilerOutput, InvocationError>;
}

/// Runs `solc --standard-json` as a subprocess
#[derive(Debug, Clone)]
pub struct SolcCompiler {
    project_root: PathBuf,
    compilers_dir: Option<PathBuf>,
    poll_interval: Duration,
}

impl SolcCompiler {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            compilers_dir: None,
            poll_interval: Duration::from_millis(25),
        }
    }

    /// Directory holding `solc-<version>` binaries
    pub fn with_compilers_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.compilers_dir = dir;
        self
    }

    /// Binary used for `profile`: explicit path, then the compilers dir, then `PATH`
    pub fn binary_for(&self, profile: &CompilerProfile) -> PathBuf {
        if let Some(path) = &profile.path {
            return path.clone();
        }

        let name = format!("solc-{}", profile.version);
        match &self.compilers_dir {
            Some(dir) if dir.join(&name).exists() => dir.join(name),
            _ => PathBuf::from(name),
        }
    }

    fn command(&self, binary: &Path, version: &Version) -> Command {
        let mut cmd = Command::new(binary);
        cmd.current_dir(&self.project_root)
            .args(["--standard-json", "--allow-paths", "."]);
        // --base-path only exists from 0.6.9 on
        if *version >= Version::new(0, 6, 9) {
            cmd.args(["--base-path", "."]);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl CompilerBackend for SolcCompiler {
    fn compile(
        &self,
        profile: &CompilerProfile,
        input: &CompilerInput,
        cancel: &CancelHandle,
    ) -> Result<CompilerOutput, InvocationError> {
        let binary = self.binary_for(profile);
        let payload = serde_json::to_vec(&input.to_standard_json(profile))
            .map_err(|e| InvocationError::InvalidOutput(e.to_string()))?;

        let mut cmd = self.command(&binary, &profile.version);
        tracing::debug!("Running: {:?} ({} sources)", cmd, input.sources.len());

        let mut child = cmd.spawn().map_err(|error| InvocationError::Spawn {
            binary: binary.clone(),
            error,
        })?;

        // Feed stdin and drain the pipes on helper threads so a large
        // payload or output cannot deadlock against the child
        let mut stdin = child.stdin.take();
        let writer = std::thread::spawn(move || {
            if let Some(stdin) = stdin.as_mut() {
                let _ = stdin.write_all(&payload);
            }
        });
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = loop {
            if cancel.is_cancelled() {
                tracing::debug!("Killing solc {} after cancellation", profile.version);
                let _ = child.kill();
                let _ = child.wait();
                return Err(InvocationError::Cancelled);
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => std::thread::sleep(self.poll_interval),
                Err(e) => return Err(InvocationError::InvalidOutput(e.to_string())),
            }
        };

        let _ = writer.join();
        let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
        let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();

        if stdout.is_empty() {
            return Err(InvocationError::Failed {
                status: status.code(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        serde_json::from_slice(&stdout).map_err(|e| InvocationError::InvalidOutput(e.to_string()))
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}
