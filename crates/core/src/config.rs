//! Project manifest (`builder.toml`) and per-invocation build options

use crate::blockchain::{NetworkRegistry, NetworkTarget};
use crate::error::BuildResult;
use crate::gas::GasReporterConfig;
use crate::processors::{resolve_dir, PostProcessor, ProcessorConfig};
use crate::registry::{CompilerProfile, CompilerRegistry};
use eyre::{Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Default manifest file name
pub const CONFIG_FILE: &str = "builder.toml";

/// Everything declared in `builder.toml`
///
/// ```toml
/// default_compiler = "0.8.2"
///
/// [[compilers]]
/// version = "0.8.2"
/// optimizer = { enabled = true, runs = 200 }
///
/// [networks.bsc_testnet]
/// url = "https://data-seed-prebsc-1-s1.binance.org:8545"
/// chain_id = 97
/// gas_price = 20000000000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub compilers: Vec<CompilerProfile>,

    /// Version used for units without a pragma
    #[serde(default)]
    pub default_compiler: Option<Version>,

    /// Directory holding `solc-<version>` binaries
    #[serde(default)]
    pub compilers_dir: Option<PathBuf>,

    /// Unit identifier -> compiler version, bypassing pragma resolution
    #[serde(default)]
    pub overrides: BTreeMap<String, Version>,

    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,

    #[serde(default)]
    pub default_network: Option<String>,

    #[serde(default)]
    pub processors: Vec<ProcessorConfig>,

    #[serde(default)]
    pub gas_reporter: GasReporterConfig,

    #[serde(default)]
    pub test_runner: TestRunnerConfig,

    #[serde(default)]
    pub coverage_policy: CoveragePolicy,

    /// Directory the manifest was loaded from; relative paths resolve against it
    #[serde(skip)]
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_sources")]
    pub sources: PathBuf,
    #[serde(default = "default_artifacts")]
    pub artifacts: PathBuf,
}

fn default_sources() -> PathBuf {
    PathBuf::from("contracts")
}

fn default_artifacts() -> PathBuf {
    PathBuf::from("artifacts")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            artifacts: default_artifacts(),
        }
    }
}

/// Network entry in `builder.toml`; the table key is the network name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub url: String,
    pub chain_id: u64,
    /// Gas price in wei
    #[serde(default = "default_gas_price")]
    pub gas_price: u64,
}

fn default_gas_price() -> u64 {
    1_000_000_000
}

/// Settings handed through to an external test runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunnerConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_tests")]
    pub tests: PathBuf,
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_tests() -> PathBuf {
    PathBuf::from("test")
}

impl Default for TestRunnerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            tests: default_tests(),
        }
    }
}

/// What to do when coverage instrumentation meets optimizer-enabled compilers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoveragePolicy {
    /// Build anyway and record a warning
    #[default]
    Warn,
    /// Abort before compiling
    Reject,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            compilers: vec![],
            default_compiler: None,
            compilers_dir: None,
            overrides: BTreeMap::new(),
            networks: BTreeMap::new(),
            default_network: None,
            processors: vec![],
            gas_reporter: GasReporterConfig::default(),
            test_runner: TestRunnerConfig::default(),
            coverage_policy: CoveragePolicy::default(),
            root: PathBuf::from("."),
        }
    }
}

impl ProjectConfig {
    /// Load a manifest from disk
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let root = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self::parse(&content, root)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Parse manifest text, resolving relative paths against `root`
    pub fn parse(content: &str, root: impl Into<PathBuf>) -> Result<Self> {
        let mut config: ProjectConfig = toml::from_str(content)?;
        config.root = root.into();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for processor in &self.processors {
            if !names.insert(processor.name()) {
                eyre::bail!("Post-processor name '{}' is used twice", processor.name());
            }
        }
        self.processors()?;
        Ok(())
    }

    pub fn sources_dir(&self) -> PathBuf {
        resolve_dir(&self.root, &self.paths.sources)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        resolve_dir(&self.root, &self.paths.artifacts)
    }

    pub fn tests_dir(&self) -> PathBuf {
        resolve_dir(&self.root, &self.test_runner.tests)
    }

    pub fn compilers_dir(&self) -> Option<PathBuf> {
        self.compilers_dir
            .as_deref()
            .map(|dir| resolve_dir(&self.root, dir))
    }

    /// Registry of the declared compilers, with the configured default pinned
    pub fn compiler_registry(&self) -> BuildResult<CompilerRegistry> {
        let profiles = self.compilers.iter().cloned().map(|mut profile| {
            profile.path = profile.path.map(|path| resolve_dir(&self.root, &path));
            profile
        });
        let mut registry = CompilerRegistry::from_profiles(profiles)?;
        if let Some(version) = &self.default_compiler {
            registry.set_default(version.clone())?;
        }
        Ok(registry)
    }

    /// Declared networks plus the built-in `local` node unless redefined
    pub fn network_registry(&self) -> BuildResult<NetworkRegistry> {
        let mut targets: Vec<NetworkTarget> = self
            .networks
            .iter()
            .map(|(name, n)| NetworkTarget::custom(name, &n.url, n.chain_id, n.gas_price))
            .collect();
        if !self.networks.contains_key("local") {
            targets.push(NetworkTarget::local());
        }

        let mut registry = NetworkRegistry::from_targets(targets);
        if let Some(name) = &self.default_network {
            registry.set_default(name)?;
        }
        Ok(registry)
    }

    /// Instantiate the declared post-processors
    ///
    /// Processors reconcile their output location, deleting whatever they
    /// did not generate, so a location may not overlap the project root, the
    /// sources or the artifacts.
    pub fn processors(&self) -> Result<Vec<Box<dyn PostProcessor>>> {
        let sources_dir = self.sources_dir();
        let artifacts_dir = self.artifacts_dir();
        let processors = self
            .processors
            .iter()
            .cloned()
            .map(|config| config.into_processor(&self.root, &sources_dir))
            .collect::<Result<Vec<_>>>()?;

        for processor in processors.iter().filter(|p| !p.edits_sources()) {
            let location = processor.output_location();
            let conflict = if self.root.starts_with(location) {
                Some(("project root", self.root.as_path()))
            } else {
                [("sources", sources_dir.as_path()), ("artifacts", artifacts_dir.as_path())]
                    .into_iter()
                    .find(|(_, dir)| location.starts_with(dir) || dir.starts_with(location))
            };
            if let Some((what, dir)) = conflict {
                eyre::bail!(
                    "Output location {} of post-processor '{}' overlaps the {} in {}",
                    location.display(),
                    processor.name(),
                    what,
                    dir.display()
                );
            }
        }
        Ok(processors)
    }

    /// Options for a build of this project
    pub fn build_options(&self) -> BuildOptionsBuilder {
        BuildOptions::builder()
            .project_root(self.root.clone())
            .sources_dir(self.paths.sources.clone())
            .artifacts_dir(self.paths.artifacts.clone())
            .overrides(self.overrides.clone())
            .coverage_policy(self.coverage_policy)
    }
}

/// Options for a single build invocation
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
    /// Project root; unit identifiers are relative to it
    pub project_root: PathBuf,

    /// Directory scanned for sources
    /// If relative, it's relative to project_root
    pub sources_dir: PathBuf,

    /// Directory artifacts are written to and reconciled
    /// If relative, it's relative to project_root
    pub artifacts_dir: PathBuf,

    /// Unit identifier -> compiler version
    pub overrides: BTreeMap<String, Version>,

    pub coverage_policy: CoveragePolicy,

    /// Processors to run in addition to the run-on-build ones
    pub requested_processors: Vec<String>,

    /// Gas price in wei for gas report costs
    pub network_gas_price: Option<u64>,

    /// Run post-processors after compiling; off for builds that must leave
    /// sources and generated outputs untouched
    pub post_process: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            sources_dir: default_sources(),
            artifacts_dir: default_artifacts(),
            overrides: BTreeMap::new(),
            coverage_policy: CoveragePolicy::default(),
            requested_processors: vec![],
            network_gas_price: None,
            post_process: true,
        }
    }
}

impl BuildOptions {
    /// Create a new builder for BuildOptions
    pub fn builder() -> BuildOptionsBuilder {
        BuildOptionsBuilder::default()
    }

    /// Reconciliation deletes everything it did not write, so the artifacts
    /// directory must never enclose the sources
    pub fn validate(&self) -> Result<()> {
        if self.artifacts_dir == self.project_root || self.sources_dir.starts_with(&self.artifacts_dir) {
            eyre::bail!(
                "Artifacts directory {} must not contain the sources in {}",
                self.artifacts_dir.display(),
                self.sources_dir.display()
            );
        }
        Ok(())
    }
}

/// Builder for creating BuildOptions with a fluent API
#[derive(Default)]
pub struct BuildOptionsBuilder {
    options: BuildOptions,
}

impl BuildOptionsBuilder {
    /// Set the project root directory
    pub fn project_root(mut self, path: PathBuf) -> Self {
        self.options.project_root = path;
        self
    }

    /// Set the sources directory
    pub fn sources_dir(mut self, path: PathBuf) -> Self {
        self.options.sources_dir = path;
        self
    }

    /// Set the artifacts directory
    pub fn artifacts_dir(mut self, path: PathBuf) -> Self {
        self.options.artifacts_dir = path;
        self
    }

    /// Replace all per-unit compiler overrides
    pub fn overrides(mut self, overrides: BTreeMap<String, Version>) -> Self {
        self.options.overrides = overrides;
        self
    }

    /// Pin a single unit to a compiler version
    pub fn override_version(mut self, unit: impl Into<String>, version: Version) -> Self {
        self.options.overrides.insert(unit.into(), version);
        self
    }

    pub fn coverage_policy(mut self, policy: CoveragePolicy) -> Self {
        self.options.coverage_policy = policy;
        self
    }

    /// Request a processor by name for this invocation
    pub fn request_processor(mut self, name: impl Into<String>) -> Self {
        self.options.requested_processors.push(name.into());
        self
    }

    pub fn requested_processors(mut self, names: Vec<String>) -> Self {
        self.options.requested_processors = names;
        self
    }

    pub fn network_gas_price(mut self, gas_price: Option<u64>) -> Self {
        self.options.network_gas_price = gas_price;
        self
    }

    /// Compile and write artifacts only
    pub fn skip_post_processing(mut self) -> Self {
        self.options.post_process = false;
        self
    }

    /// Resolve relative directories and validate the options
    pub fn build(mut self) -> Result<BuildOptions> {
        let root = &self.options.project_root;
        self.options.sources_dir = resolve_dir(root, &self.options.sources_dir);
        self.options.artifacts_dir = resolve_dir(root, &self.options.artifacts_dir);
        self.options.validate()?;
        Ok(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildError;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const MANIFEST: &str = r#"
        default_compiler = "0.8.2"
        default_network = "bsc_testnet"
        coverage_policy = "reject"
        compilers_dir = "bin/solc"

        [paths]
        sources = "src"
        artifacts = "out"

        [[compilers]]
        version = "0.6.6"
        path = "bin/solc-legacy"
        [compilers.optimizer]
        enabled = true
        runs = 999999
        details = { yul = true, yulDetails = { stackAllocation = true } }

        [[compilers]]
        version = "0.8.2"
        [compilers.extra]
        evmVersion = "istanbul"

        [overrides]
        "src/Legacy.sol" = "0.6.6"

        [networks.bsc_testnet]
        url = "https://data-seed-prebsc-1-s1.binance.org:8545"
        chain_id = 97
        gas_price = 20000000000

        [[processors]]
        kind = "license"
        license = "MIT"

        [[processors]]
        kind = "type-bindings"
        target = "solidity"

        [gas_reporter]
        enabled = true
        currency = "CNY"

        [test_runner]
        timeout_ms = 100000
    "#;

    #[test]
    fn test_default_config() {
        let config = ProjectConfig::parse("", "/project").unwrap();
        assert_eq!(config.sources_dir(), PathBuf::from("/project/contracts"));
        assert_eq!(config.artifacts_dir(), PathBuf::from("/project/artifacts"));
        assert_eq!(config.tests_dir(), PathBuf::from("/project/test"));
        assert_eq!(config.test_runner.timeout_ms, 20_000);
        assert_eq!(config.coverage_policy, CoveragePolicy::Warn);
        assert!(!config.gas_reporter.enabled);
        assert!(config.compiler_registry().unwrap().is_empty());

        let networks = config.network_registry().unwrap();
        assert_eq!(networks.get("local").unwrap().chain_id, 1337);
    }

    #[test]
    fn test_full_manifest() {
        let config = ProjectConfig::parse(MANIFEST, "/project").unwrap();

        assert_eq!(config.sources_dir(), PathBuf::from("/project/src"));
        assert_eq!(config.artifacts_dir(), PathBuf::from("/project/out"));
        assert_eq!(config.compilers_dir(), Some(PathBuf::from("/project/bin/solc")));
        assert_eq!(config.coverage_policy, CoveragePolicy::Reject);
        assert_eq!(config.test_runner.timeout_ms, 100_000);
        assert_eq!(config.gas_reporter.currency, "CNY");
        assert_eq!(config.overrides["src/Legacy.sol"], Version::new(0, 6, 6));

        let registry = config.compiler_registry().unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.default_profile().unwrap().version, Version::new(0, 8, 2));

        let legacy = registry.lookup(&Version::new(0, 6, 6)).unwrap();
        assert!(legacy.optimizer.enabled);
        assert_eq!(legacy.optimizer.runs, 999_999);
        assert_eq!(
            legacy.optimizer.details,
            Some(json!({ "yul": true, "yulDetails": { "stackAllocation": true } }))
        );
        assert_eq!(legacy.path, Some(PathBuf::from("/project/bin/solc-legacy")));

        let modern = registry.lookup(&Version::new(0, 8, 2)).unwrap();
        assert!(!modern.optimizer.enabled);
        assert_eq!(modern.extra["evmVersion"], json!("istanbul"));

        let networks = config.network_registry().unwrap();
        let testnet = networks.resolve(None).unwrap();
        assert_eq!(testnet.name, "bsc_testnet");
        assert_eq!(testnet.chain_id, 97);
        assert_eq!(testnet.gas_price, 20_000_000_000);

        let processors = config.processors().unwrap();
        let names: Vec<_> = processors.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["license", "type-bindings"]);
        assert_eq!(processors[0].output_location(), Path::new("/project/src"));
    }

    #[test]
    fn test_unregistered_default_compiler() {
        let config = ProjectConfig::parse(
            r#"
            default_compiler = "0.5.16"
            [[compilers]]
            version = "0.8.2"
            "#,
            ".",
        )
        .unwrap();
        assert!(matches!(
            config.compiler_registry(),
            Err(BuildError::UnknownVersion(v)) if v == Version::new(0, 5, 16)
        ));
    }

    #[test]
    fn test_duplicate_compiler_version() {
        let config = ProjectConfig::parse(
            r#"
            [[compilers]]
            version = "0.8.2"
            [[compilers]]
            version = "0.8.2"
            optimizer = { enabled = true }
            "#,
            ".",
        )
        .unwrap();
        assert!(matches!(
            config.compiler_registry(),
            Err(BuildError::DuplicateVersion(_))
        ));
    }

    #[test]
    fn test_unknown_default_network() {
        let config = ProjectConfig::parse("default_network = \"mainnet\"", ".").unwrap();
        assert!(matches!(
            config.network_registry(),
            Err(BuildError::UnknownNetwork(name)) if name == "mainnet"
        ));
    }

    #[test]
    fn test_duplicate_processor_names() {
        let result = ProjectConfig::parse(
            r#"
            [[processors]]
            kind = "docgen"
            [[processors]]
            kind = "docgen"
            "#,
            ".",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_processor_locations_must_not_overlap_project_dirs() {
        let with_processor = |table: &str| {
            ProjectConfig::parse(&format!("[[processors]]\n{table}\n"), "/project")
        };

        for table in [
            "kind = \"type-bindings\"\nout_dir = \"contracts/generated\"",
            "kind = \"type-bindings\"\nout_dir = \".\"",
            "kind = \"coverage\"\nout_dir = \"artifacts/coverage\"",
            "kind = \"docgen\"\npath = \"/\"",
            "kind = \"docgen\"\npath = \"contracts\"",
        ] {
            let err = with_processor(table).unwrap_err();
            assert!(format!("{err:#}").contains("overlaps"), "{table}: {err:#}");
        }

        assert!(with_processor("kind = \"type-bindings\"\nout_dir = \"typechain\"").is_ok());
        assert!(with_processor("kind = \"docgen\"\npath = \"docs/contracts\"").is_ok());
        assert!(with_processor("kind = \"license\"").is_ok());
    }

    #[test]
    fn test_load_resolves_against_config_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        std::fs::write(&path, "[paths]\nsources = \"src\"\n").unwrap();

        let config = ProjectConfig::load(&path).unwrap();
        assert_eq!(config.root, temp.path());
        assert_eq!(config.sources_dir(), temp.path().join("src"));

        let missing = ProjectConfig::load(&temp.path().join("missing.toml"));
        assert!(missing.is_err());
    }

    #[test]
    fn test_builder_basic() {
        let options = BuildOptions::builder()
            .project_root(PathBuf::from("/test"))
            .artifacts_dir(PathBuf::from("build"))
            .override_version("contracts/A.sol", Version::new(0, 7, 6))
            .request_processor("docgen")
            .coverage_policy(CoveragePolicy::Reject)
            .build()
            .unwrap();

        assert_eq!(options.sources_dir, PathBuf::from("/test/contracts"));
        assert_eq!(options.artifacts_dir, PathBuf::from("/test/build"));
        assert_eq!(options.overrides.len(), 1);
        assert_eq!(options.requested_processors, vec!["docgen"]);
        assert_eq!(options.coverage_policy, CoveragePolicy::Reject);
        assert!(options.post_process);

        let compile_only = BuildOptions::builder().skip_post_processing().build().unwrap();
        assert!(!compile_only.post_process);
    }

    #[test]
    fn test_builder_rejects_artifacts_enclosing_sources() {
        let at_root = BuildOptions::builder()
            .project_root(PathBuf::from("/test"))
            .artifacts_dir(PathBuf::from("."))
            .build();
        assert!(at_root.is_err());

        let enclosing = BuildOptions::builder()
            .project_root(PathBuf::from("/test"))
            .sources_dir(PathBuf::from("build/contracts"))
            .artifacts_dir(PathBuf::from("build"))
            .build();
        assert!(enclosing.is_err());
    }

    #[test]
    fn test_build_options_from_config() {
        let config = ProjectConfig::parse(MANIFEST, "/project").unwrap();
        let options = config.build_options().build().unwrap();
        assert_eq!(options.project_root, PathBuf::from("/project"));
        assert_eq!(options.sources_dir, PathBuf::from("/project/src"));
        assert_eq!(options.artifacts_dir, PathBuf::from("/project/out"));
        assert_eq!(options.coverage_policy, CoveragePolicy::Reject);
        assert_eq!(options.overrides, config.overrides);
    }
}
