//! Compiler version registry

use crate::error::{BuildError, BuildResult};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Optimizer settings passed to the compiler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    pub enabled: bool,
    #[serde(default = "default_runs")]
    pub runs: u32,
    /// Fine-grained optimizer steps (`yul`, `yulDetails`, ...), passed through verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

fn default_runs() -> u32 {
    200
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            runs: default_runs(),
            details: None,
        }
    }
}

/// A compiler version together with the settings it is invoked with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilerProfile {
    pub version: Version,
    #[serde(default)]
    pub optimizer: OptimizerSettings,
    /// Extra top-level compiler settings (`evmVersion`, `viaIR`, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
    /// Explicit compiler binary, overriding the lookup convention
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl CompilerProfile {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            optimizer: OptimizerSettings::default(),
            extra: BTreeMap::new(),
            path: None,
        }
    }

    /// Enable the optimizer with the given number of runs
    pub fn with_optimizer(mut self, runs: u32) -> Self {
        self.optimizer.enabled = true;
        self.optimizer.runs = runs;
        self
    }

    /// Add an extra compiler setting
    pub fn with_setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Settings object for the compiler's standard JSON input
    pub fn settings_json(&self) -> serde_json::Map<String, Value> {
        let mut settings: serde_json::Map<String, Value> = self
            .extra
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut optimizer = serde_json::Map::new();
        optimizer.insert("enabled".into(), Value::Bool(self.optimizer.enabled));
        optimizer.insert("runs".into(), Value::from(self.optimizer.runs));
        if let Some(details) = &self.optimizer.details {
            optimizer.insert("details".into(), details.clone());
        }
        settings.insert("optimizer".into(), Value::Object(optimizer));
        settings
    }
}

/// Registry of available compiler profiles, keyed by version
///
/// Built once from configuration and shared read-only between build workers.
#[derive(Debug, Clone, Default)]
pub struct CompilerRegistry {
    profiles: BTreeMap<Version, CompilerProfile>,
    default_version: Option<Version>,
}

impl CompilerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a list of profiles
    pub fn from_profiles(profiles: impl IntoIterator<Item = CompilerProfile>) -> BuildResult<Self> {
        let mut registry = Self::new();
        for profile in profiles {
            registry.register(profile)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, profile: CompilerProfile) -> BuildResult<()> {
        if self.profiles.contains_key(&profile.version) {
            return Err(BuildError::DuplicateVersion(profile.version));
        }
        tracing::debug!("Registered compiler {}", profile.version);
        self.profiles.insert(profile.version.clone(), profile);
        Ok(())
    }

    pub fn lookup(&self, version: &Version) -> BuildResult<&CompilerProfile> {
        self.profiles
            .get(version)
            .ok_or_else(|| BuildError::UnknownVersion(version.clone()))
    }

    /// Pin the profile used for units without a version constraint
    pub fn set_default(&mut self, version: Version) -> BuildResult<()> {
        self.lookup(&version)?;
        self.default_version = Some(version);
        Ok(())
    }

    /// The configured default, falling back to the highest registered version
    pub fn default_profile(&self) -> Option<&CompilerProfile> {
        match &self.default_version {
            Some(version) => self.profiles.get(version),
            None => self.profiles.values().next_back(),
        }
    }

    /// All profiles in ascending version order
    pub fn profiles(&self) -> impl DoubleEndedIterator<Item = &CompilerProfile> {
        self.profiles.values()
    }

    /// Registered versions, ascending
    pub fn versions(&self) -> impl DoubleEndedIterator<Item = &Version> {
        self.profiles.keys()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile(v: &str) -> CompilerProfile {
        CompilerProfile::new(Version::parse(v).unwrap()).with_optimizer(200)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry =
            CompilerRegistry::from_profiles([profile("0.8.0"), profile("0.6.6")]).unwrap();
        assert_eq!(registry.len(), 2);

        let found = registry.lookup(&Version::new(0, 6, 6)).unwrap();
        assert!(found.optimizer.enabled);

        let missing = registry.lookup(&Version::new(0, 7, 6));
        assert!(matches!(missing, Err(BuildError::UnknownVersion(_))));
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let result = CompilerRegistry::from_profiles([profile("0.8.2"), profile("0.8.2")]);
        assert!(matches!(result, Err(BuildError::DuplicateVersion(v)) if v == Version::new(0, 8, 2)));
    }

    #[test]
    fn test_default_profile() {
        let mut registry =
            CompilerRegistry::from_profiles([profile("0.8.2"), profile("0.4.13"), profile("0.8.0")])
                .unwrap();
        assert_eq!(registry.default_profile().unwrap().version, Version::new(0, 8, 2));

        registry.set_default(Version::new(0, 8, 0)).unwrap();
        assert_eq!(registry.default_profile().unwrap().version, Version::new(0, 8, 0));

        assert!(registry.set_default(Version::new(0, 5, 0)).is_err());
        assert!(CompilerRegistry::new().default_profile().is_none());
    }

    #[test]
    fn test_settings_json() {
        let mut p = profile("0.6.6").with_setting("evmVersion", json!("istanbul"));
        p.optimizer.details = Some(json!({ "yul": true }));

        let settings = Value::Object(p.settings_json());
        assert_eq!(
            settings,
            json!({
                "evmVersion": "istanbul",
                "optimizer": { "enabled": true, "runs": 200, "details": { "yul": true } }
            })
        );
    }
}
