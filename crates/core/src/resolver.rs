//! Source-to-compiler resolution
//!
//! Assigns exactly one registered compiler profile to every source unit:
//!
//! 1. an explicit per-file override wins (and must name a registered version)
//! 2. a constraint pinning one registered version selects it
//! 3. otherwise the highest registered version satisfying the constraint
//! 4. units without a constraint get the registry default

use crate::error::{BuildError, BuildResult};
use crate::registry::{CompilerProfile, CompilerRegistry};
use crate::source::SourceUnit;
use semver::Version;
use std::collections::BTreeMap;

/// The compiler profile chosen for one source unit
#[derive(Debug, Clone, PartialEq)]
pub struct VersionAssignment<'a> {
    pub unit: &'a SourceUnit,
    pub profile: &'a CompilerProfile,
}

/// Resolve a compiler for every unit, failing on the first unresolvable unit
///
/// Pure: nothing is compiled or written.
pub fn resolve<'a>(
    units: &'a [SourceUnit],
    registry: &'a CompilerRegistry,
    overrides: &BTreeMap<String, Version>,
) -> BuildResult<Vec<VersionAssignment<'a>>> {
    units
        .iter()
        .map(|unit| {
            let profile = resolve_unit(unit, registry, overrides)?;
            tracing::debug!("{} -> solc {}", unit.id, profile.version);
            Ok(VersionAssignment { unit, profile })
        })
        .collect()
}

fn resolve_unit<'a>(
    unit: &SourceUnit,
    registry: &'a CompilerRegistry,
    overrides: &BTreeMap<String, Version>,
) -> BuildResult<&'a CompilerProfile> {
    if let Some(version) = overrides.get(&unit.id) {
        let profile = registry.lookup(version)?;
        if let Some(constraint) = &unit.declared_version {
            if !constraint.matches(version) {
                return Err(BuildError::unresolvable(
                    &unit.id,
                    format!("{constraint} (override {version})"),
                ));
            }
        }
        return Ok(profile);
    }

    let Some(constraint) = &unit.declared_version else {
        return registry
            .default_profile()
            .ok_or_else(|| BuildError::unresolvable(&unit.id, "*"));
    };

    if let Some(exact) = constraint.exact_version() {
        if let Ok(profile) = registry.lookup(&exact) {
            return Ok(profile);
        }
    }

    registry
        .profiles()
        .rev()
        .find(|profile| constraint.matches(&profile.version))
        .ok_or_else(|| BuildError::unresolvable(&unit.id, constraint))
}

/// Group assignments by compiler version, preserving unit order inside a group
pub fn group_by_version<'a, 'b>(
    assignments: &'b [VersionAssignment<'a>],
) -> BTreeMap<&'a Version, Vec<&'b VersionAssignment<'a>>> {
    let mut groups: BTreeMap<&'a Version, Vec<&'b VersionAssignment<'a>>> = BTreeMap::new();
    for assignment in assignments {
        groups
            .entry(&assignment.profile.version)
            .or_default()
            .push(assignment);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(versions: &[&str]) -> CompilerRegistry {
        CompilerRegistry::from_profiles(
            versions
                .iter()
                .map(|v| CompilerProfile::new(Version::parse(v).unwrap())),
        )
        .unwrap()
    }

    fn unit(id: &str, pragma: Option<&str>) -> SourceUnit {
        let content = match pragma {
            Some(p) => format!("pragma solidity {p};\ncontract C {{}}\n"),
            None => "contract C {}\n".to_string(),
        };
        SourceUnit::new(id, content).unwrap()
    }

    #[test]
    fn test_default_and_highest_satisfying() {
        let registry = registry(&["0.8.0", "0.8.2"]);
        let units = vec![unit("A.sol", None), unit("B.sol", Some("^0.8.0"))];

        let assignments = resolve(&units, &registry, &BTreeMap::new()).unwrap();
        assert_eq!(assignments[0].profile.version, Version::new(0, 8, 2));
        assert_eq!(assignments[1].profile.version, Version::new(0, 8, 2));
    }

    #[test]
    fn test_exact_match_first() {
        let registry = registry(&["0.8.0", "0.8.2"]);
        let units = vec![unit("A.sol", Some("0.8.0"))];

        let assignments = resolve(&units, &registry, &BTreeMap::new()).unwrap();
        assert_eq!(assignments[0].profile.version, Version::new(0, 8, 0));
    }

    #[test]
    fn test_single_satisfying_profile_is_deterministic() {
        let registry = registry(&["0.4.13", "0.5.16", "0.6.6", "0.7.6", "0.8.0", "0.8.2"]);
        let units = vec![unit("Old.sol", Some(">=0.5.0 <0.6.0"))];

        for _ in 0..3 {
            let assignments = resolve(&units, &registry, &BTreeMap::new()).unwrap();
            assert_eq!(assignments[0].profile.version, Version::new(0, 5, 16));
        }
    }

    #[test]
    fn test_unsatisfiable_constraint() {
        let registry = registry(&["0.8.0", "0.8.2"]);
        let units = vec![unit("A.sol", None), unit("Future.sol", Some("^0.9.0"))];

        let err = resolve(&units, &registry, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, BuildError::UnresolvableVersion { ref unit, .. } if unit == "Future.sol"));
    }

    #[test]
    fn test_empty_registry_unresolvable() {
        let registry = CompilerRegistry::new();
        let units = vec![unit("A.sol", None)];
        assert!(matches!(
            resolve(&units, &registry, &BTreeMap::new()),
            Err(BuildError::UnresolvableVersion { .. })
        ));
    }

    #[test]
    fn test_override_wins_and_is_validated() {
        let registry = registry(&["0.8.0", "0.8.2"]);
        let units = vec![unit("A.sol", Some("^0.8.0"))];

        let overrides = BTreeMap::from([("A.sol".to_string(), Version::new(0, 8, 0))]);
        let assignments = resolve(&units, &registry, &overrides).unwrap();
        assert_eq!(assignments[0].profile.version, Version::new(0, 8, 0));

        let unknown = BTreeMap::from([("A.sol".to_string(), Version::new(0, 7, 6))]);
        assert!(matches!(
            resolve(&units, &registry, &unknown),
            Err(BuildError::UnknownVersion(_))
        ));
    }

    #[test]
    fn test_group_by_version() {
        let registry = registry(&["0.6.6", "0.8.2"]);
        let units = vec![
            unit("A.sol", Some("^0.8.0")),
            unit("B.sol", Some("0.6.6")),
            unit("C.sol", None),
        ];
        let assignments = resolve(&units, &registry, &BTreeMap::new()).unwrap();
        let groups = group_by_version(&assignments);

        assert_eq!(groups.len(), 2);
        let latest: Vec<_> = groups[&Version::new(0, 8, 2)]
            .iter()
            .map(|a| a.unit.id.as_str())
            .collect();
        assert_eq!(latest, vec!["A.sol", "C.sol"]);
    }
}
