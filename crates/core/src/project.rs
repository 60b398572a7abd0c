//! A loaded project: manifest plus the registries built from it

use crate::artifacts::{ArtifactSet, CompiledContract};
use crate::blockchain::NetworkRegistry;
use crate::builder::{self, BuildContext, BuildOutcome};
use crate::cancel::CancelHandle;
use crate::compiler::{CompilerBackend, SolcCompiler};
use crate::config::{BuildOptions, ProjectConfig};
use crate::error::BuildResult;
use crate::gas::GasReporter;
use crate::processors::PostProcessor;
use crate::registry::CompilerRegistry;
use crate::resolver::{self, VersionAssignment};
use crate::source::{discover_sources, SourceUnit};
use eyre::Result;
use std::path::Path;

#[derive(Debug)]
pub struct Project {
    pub config: ProjectConfig,
    pub registry: CompilerRegistry,
    pub networks: NetworkRegistry,
    pub processors: Vec<Box<dyn PostProcessor>>,
    pub gas_reporter: GasReporter,
}

impl Project {
    /// Load `builder.toml` and construct everything it declares
    pub fn load(config_path: &Path) -> Result<Self> {
        Self::from_config(ProjectConfig::load(config_path)?)
    }

    pub fn from_config(config: ProjectConfig) -> Result<Self> {
        let registry = config.compiler_registry()?;
        let networks = config.network_registry()?;
        let processors = config.processors()?;
        let gas_reporter = GasReporter::new(config.gas_reporter.clone());

        tracing::debug!(
            "Loaded project at {} with {} compiler(s) and {} post-processor(s)",
            config.root.display(),
            registry.len(),
            processors.len()
        );

        Ok(Self {
            config,
            registry,
            networks,
            processors,
            gas_reporter,
        })
    }

    /// Source units found in the configured sources directory
    pub fn sources(&self) -> Result<Vec<SourceUnit>> {
        discover_sources(&self.config.root, &self.config.paths.sources)
    }

    /// Compiler assignment for `units` without compiling anything
    pub fn resolve<'a>(&'a self, units: &'a [SourceUnit]) -> BuildResult<Vec<VersionAssignment<'a>>> {
        resolver::resolve(units, &self.registry, &self.config.overrides)
    }

    /// Gas price of the default network, if one is configured
    pub fn network_gas_price(&self) -> Option<u64> {
        self.networks.resolve(None).ok().map(|n| n.gas_price)
    }

    pub fn options(&self, requested: &[String]) -> Result<BuildOptions> {
        self.config
            .build_options()
            .requested_processors(requested.to_vec())
            .network_gas_price(self.network_gas_price())
            .build()
    }

    /// The `solc` subprocess backend for this project
    pub fn compiler(&self) -> SolcCompiler {
        SolcCompiler::new(self.config.root.clone()).with_compilers_dir(self.config.compilers_dir())
    }

    /// Build every source unit with `solc`
    pub fn build(&self, requested: &[String], cancel: &CancelHandle) -> Result<BuildOutcome> {
        self.build_with(&self.compiler(), requested, cancel)
    }

    pub fn build_with(
        &self,
        compiler: &dyn CompilerBackend,
        requested: &[String],
        cancel: &CancelHandle,
    ) -> Result<BuildOutcome> {
        self.run(compiler, &self.options(requested)?, cancel)
    }

    /// Compile and write artifacts without running any post-processor,
    /// leaving sources and generated outputs as they are
    pub fn compile_only(&self, cancel: &CancelHandle) -> Result<BuildOutcome> {
        self.compile_only_with(&self.compiler(), cancel)
    }

    pub fn compile_only_with(
        &self,
        compiler: &dyn CompilerBackend,
        cancel: &CancelHandle,
    ) -> Result<BuildOutcome> {
        let options = self
            .config
            .build_options()
            .network_gas_price(self.network_gas_price())
            .skip_post_processing()
            .build()?;
        self.run(compiler, &options, cancel)
    }

    fn run(
        &self,
        compiler: &dyn CompilerBackend,
        options: &BuildOptions,
        cancel: &CancelHandle,
    ) -> Result<BuildOutcome> {
        let units = self.sources()?;
        let ctx = BuildContext {
            registry: &self.registry,
            compiler,
            processors: &self.processors,
            gas_reporter: &self.gas_reporter,
            options,
        };
        Ok(builder::build(&ctx, &units, cancel)?)
    }
}

/// Find a contract by `Name` or `path/to/Unit.sol:Name`
pub fn find_contract(artifacts: &ArtifactSet, query: &str) -> Result<CompiledContract> {
    let (unit, name) = match query.rsplit_once(':') {
        Some((unit, name)) => (Some(unit), name),
        None => (None, query),
    };

    let mut matches: Vec<(String, CompiledContract)> = artifacts
        .snapshot()
        .iter()
        .filter(|artifact| unit.map_or(true, |u| artifact.unit == u))
        .filter_map(|artifact| {
            artifact
                .contracts
                .get(name)
                .map(|contract| (artifact.unit.clone(), contract.clone()))
        })
        .collect();

    match matches.len() {
        0 => eyre::bail!("No compiled contract named '{}'", query),
        1 => Ok(matches.remove(0).1),
        _ => {
            let units: Vec<String> = matches.into_iter().map(|(u, _)| format!("{u}:{name}")).collect();
            eyre::bail!("Contract name '{}' is ambiguous: {}", name, units.join(", "))
        }
    }
}
