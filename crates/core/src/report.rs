//! End-of-invocation build report

use crate::compiler::Diagnostic;
use crate::error::BuildError;
use crate::gas::GasRow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Terminal status of a build invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// At least one unit compiled (or there was nothing to compile)
    Completed,
    /// Every unit failed to compile
    Failed,
    Cancelled,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Phases a build moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    Pending,
    Resolving,
    Compiling,
    PostProcessing,
    Completed,
    Failed,
    Cancelled,
}

impl BuildPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Move to `next`, logging the transition
    pub fn advance(&mut self, next: BuildPhase) {
        debug_assert!(!self.is_terminal(), "build already finished");
        tracing::debug!("Build phase: {:?} -> {:?}", self, next);
        *self = next;
    }
}

impl From<BuildStatus> for BuildPhase {
    fn from(status: BuildStatus) -> Self {
        match status {
            BuildStatus::Completed => Self::Completed,
            BuildStatus::Failed => Self::Failed,
            BuildStatus::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Succeeded,
    Failed,
    /// Not compiled because the build was cancelled first
    Skipped,
}

/// Outcome for one source unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub unit: String,
    pub compiler_version: String,
    pub status: UnitStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contracts: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

impl UnitReport {
    pub fn error_count(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.is_error()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessorStatus {
    Succeeded { outputs: Vec<PathBuf> },
    Failed { error: String },
    Skipped { reason: String },
}

/// Outcome for one post-processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorReport {
    pub name: String,
    pub order: i32,
    #[serde(flatten)]
    pub status: ProcessorStatus,
}

/// Structured summary of one build invocation
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub status: BuildStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub units: Vec<UnitReport>,
    pub processors: Vec<ProcessorReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gas: Vec<GasRow>,
    /// Stale artifact files removed during reconciliation
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<PathBuf>,
}

impl BuildReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            status: BuildStatus::Completed,
            started_at,
            duration_ms: 0,
            units: Vec::new(),
            processors: Vec::new(),
            warnings: Vec::new(),
            gas: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn unit(&self, id: &str) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.unit == id)
    }

    pub fn processor(&self, name: &str) -> Option<&ProcessorReport> {
        self.processors.iter().find(|p| p.name == name)
    }

    pub fn count(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }

    /// Per-unit compilation errors, in unit order
    pub fn compilation_errors(&self) -> Vec<BuildError> {
        self.units
            .iter()
            .filter(|u| u.status == UnitStatus::Failed)
            .map(|u| BuildError::CompilationError {
                unit: u.unit.clone(),
                diagnostics: u.diagnostics.clone(),
            })
            .collect()
    }

    pub fn processor_errors(&self) -> Vec<BuildError> {
        self.processors
            .iter()
            .filter_map(|p| match &p.status {
                ProcessorStatus::Failed { error } => {
                    Some(BuildError::post_processor(&p.name, error))
                }
                _ => None,
            })
            .collect()
    }

    /// Derive the terminal status from the unit outcomes
    pub fn finish(&mut self, cancelled: bool) {
        self.status = if cancelled {
            BuildStatus::Cancelled
        } else if !self.units.is_empty() && self.count(UnitStatus::Succeeded) == 0 {
            BuildStatus::Failed
        } else {
            BuildStatus::Completed
        };
        let elapsed = Utc::now().signed_duration_since(self.started_at);
        self.duration_ms = elapsed.num_milliseconds().max(0) as u64;
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        let failed_processors = self
            .processors
            .iter()
            .filter(|p| matches!(p.status, ProcessorStatus::Failed { .. }))
            .count();
        format!(
            "Build {}: {} succeeded, {} failed, {} skipped, {} processor failure(s) in {}ms",
            self.status,
            self.count(UnitStatus::Succeeded),
            self.count(UnitStatus::Failed),
            self.count(UnitStatus::Skipped),
            failed_processors,
            self.duration_ms,
        )
    }
}
