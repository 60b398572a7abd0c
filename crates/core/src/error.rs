//! Error taxonomy for the build orchestrator

use crate::compiler::Diagnostic;
use semver::Version;
use std::path::PathBuf;
use thiserror::Error;

pub type BuildResult<T> = Result<T, BuildError>;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Compiler version {0} is already registered")]
    DuplicateVersion(Version),

    #[error("Compiler version {0} is not registered")]
    UnknownVersion(Version),

    #[error("No registered compiler satisfies '{constraint}' required by {unit}")]
    UnresolvableVersion { unit: String, constraint: String },

    #[error("Invalid version constraint '{constraint}': {reason}")]
    InvalidConstraint { constraint: String, reason: String },

    #[error("Compilation failed for {unit} ({} diagnostics)", diagnostics.len())]
    CompilationError {
        unit: String,
        diagnostics: Vec<Diagnostic>,
    },

    #[error("Post-processor '{processor}' failed: {message}")]
    PostProcessorError { processor: String, message: String },

    #[error("Unknown network '{0}'")]
    UnknownNetwork(String),

    #[error("Coverage instrumentation cannot run with optimizer-enabled compilers: {}", versions.join(", "))]
    CoverageConflict { versions: Vec<String> },

    #[error("Build cancelled")]
    Cancelled,

    #[error("I/O error at {path}: {error}")]
    Io {
        path: PathBuf,
        error: std::io::Error,
    },
}

impl BuildError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, error: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            error,
        }
    }

    /// Create an unresolvable-version error
    pub fn unresolvable(unit: impl Into<String>, constraint: impl ToString) -> Self {
        Self::UnresolvableVersion {
            unit: unit.into(),
            constraint: constraint.to_string(),
        }
    }

    /// Create a post-processor error
    pub fn post_processor(processor: impl Into<String>, message: impl ToString) -> Self {
        Self::PostProcessorError {
            processor: processor.into(),
            message: message.to_string(),
        }
    }

    /// Short machine-readable kind, used by the CLI JSON output
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateVersion(_) => "duplicate_version",
            Self::UnknownVersion(_) => "unknown_version",
            Self::UnresolvableVersion { .. } => "unresolvable_version",
            Self::InvalidConstraint { .. } => "invalid_constraint",
            Self::CompilationError { .. } => "compilation_error",
            Self::PostProcessorError { .. } => "post_processor_error",
            Self::UnknownNetwork(_) => "unknown_network",
            Self::CoverageConflict { .. } => "coverage_conflict",
            Self::Cancelled => "cancelled",
            Self::Io { .. } => "io_error",
        }
    }
}
