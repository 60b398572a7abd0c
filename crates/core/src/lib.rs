//! Multi-version Solidity build orchestration
pub mod artifacts;
pub mod blockchain;
pub mod builder;
mod cancel;
pub mod compiler;
pub mod config;
mod error;
pub mod gas;
pub mod processors;
pub mod project;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod source;
mod utils;
pub mod version;

pub use artifacts::{ArtifactSet, BuildArtifact, Bytecode, CompiledContract, GeneratedOutput};
pub use blockchain::{compare_bytecode, BytecodeMatch, NetworkRegistry, NetworkTarget};
pub use builder::{build, BuildContext, BuildOutcome};
pub use cancel::CancelHandle;
pub use compiler::{CompilerBackend, CompilerInput, CompilerOutput, Diagnostic, SolcCompiler};
pub use config::{BuildOptions, BuildOptionsBuilder, CoveragePolicy, ProjectConfig, CONFIG_FILE};
pub use error::{BuildError, BuildResult};
pub use gas::{GasReporter, GasReporterConfig};
pub use processors::{PostProcessor, ProcessorConfig};
pub use project::{find_contract, Project};
pub use registry::{CompilerProfile, CompilerRegistry, OptimizerSettings};
pub use report::{BuildPhase, BuildReport, BuildStatus, ProcessorStatus, UnitStatus};
pub use resolver::{resolve, VersionAssignment};
pub use source::{discover_sources, SourceUnit};
pub use version::VersionConstraint;
