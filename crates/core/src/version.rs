//! Solidity-flavoured version constraints
//!
//! `pragma solidity` accepts npm-style ranges: space separated comparators
//! form a conjunction, `||` separates alternatives, a bare version means an
//! exact match and `a - b` is an inclusive range. Each alternative is lowered
//! into a [`semver::VersionReq`].

use crate::error::{BuildError, BuildResult};
use semver::{Comparator, Op, Version, VersionReq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// A parsed version constraint, satisfied when any alternative matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    raw: String,
    alternatives: Vec<VersionReq>,
}

impl VersionConstraint {
    /// Parse a constraint as written after `pragma solidity`
    pub fn parse(input: &str) -> BuildResult<Self> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(invalid(input, "empty constraint"));
        }

        let alternatives = raw
            .split("||")
            .map(|alt| parse_alternative(raw, alt))
            .collect::<BuildResult<Vec<_>>>()?;

        Ok(Self {
            raw: raw.to_string(),
            alternatives,
        })
    }

    /// Constraint that only accepts `version`
    pub fn exact(version: &Version) -> Self {
        let req = VersionReq {
            comparators: vec![Comparator {
                op: Op::Exact,
                major: version.major,
                minor: Some(version.minor),
                patch: Some(version.patch),
                pre: version.pre.clone(),
            }],
        };
        Self {
            raw: format!("={version}"),
            alternatives: vec![req],
        }
    }

    /// Whether `version` satisfies this constraint
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }

    /// Returns the pinned version when the constraint names exactly one
    pub fn exact_version(&self) -> Option<Version> {
        let [req] = self.alternatives.as_slice() else {
            return None;
        };
        let [cmp] = req.comparators.as_slice() else {
            return None;
        };
        match (cmp.op, cmp.minor, cmp.patch) {
            (Op::Exact, Some(minor), Some(patch)) => {
                let mut version = Version::new(cmp.major, minor, patch);
                version.pre = cmp.pre.clone();
                Some(version)
            }
            _ => None,
        }
    }

    /// Conjunction of two constraints (a unit with several pragmas)
    pub fn intersect(&self, other: &VersionConstraint) -> VersionConstraint {
        let mut alternatives = Vec::with_capacity(self.alternatives.len() * other.alternatives.len());
        for left in &self.alternatives {
            for right in &other.alternatives {
                let mut comparators = left.comparators.clone();
                comparators.extend(right.comparators.iter().cloned());
                alternatives.push(VersionReq { comparators });
            }
        }

        VersionConstraint {
            raw: format!("{}, {}", self.raw, other.raw),
            alternatives,
        }
    }

    /// The constraint as originally written
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn invalid(constraint: &str, reason: impl ToString) -> BuildError {
    BuildError::InvalidConstraint {
        constraint: constraint.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_alternative(raw: &str, alternative: &str) -> BuildResult<VersionReq> {
    let tokens = merge_operators(alternative.split_whitespace());
    if tokens.is_empty() {
        return Err(invalid(raw, "empty alternative"));
    }

    let mut comparators: Vec<String> = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if tokens.get(i + 1).map(String::as_str) == Some("-") {
            let upper = tokens
                .get(i + 2)
                .ok_or_else(|| invalid(raw, "hyphen range without upper bound"))?;
            comparators.push(format!(">={}", tokens[i]));
            comparators.push(format!("<={upper}"));
            i += 3;
            continue;
        }

        comparators.push(normalize_comparator(&tokens[i]));
        i += 1;
    }

    if comparators.iter().any(|c| c == "*") {
        comparators.retain(|c| c != "*");
        if comparators.is_empty() {
            return Ok(VersionReq::STAR);
        }
    }

    VersionReq::parse(&comparators.join(", ")).map_err(|e| invalid(raw, e))
}

/// Glue stray operators (`>= 0.6.0`) onto the version that follows them
fn merge_operators<'a>(tokens: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    let mut pending = String::new();

    for token in tokens {
        if matches!(token, "^" | "~" | ">" | ">=" | "<" | "<=" | "=") {
            pending.push_str(token);
            continue;
        }
        merged.push(format!("{pending}{token}"));
        pending.clear();
    }

    if !pending.is_empty() {
        merged.push(pending);
    }
    merged
}

fn normalize_comparator(token: &str) -> String {
    let token = token.trim_start_matches('v');
    if matches!(token, "*" | "x" | "X") {
        return "*".to_string();
    }
    if token.starts_with(|c: char| c.is_ascii_digit()) {
        // A bare version is exact in Solidity, unlike Cargo's caret default
        return format!("={token}");
    }
    token.to_string()
}

impl FromStr for VersionConstraint {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for VersionConstraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for VersionConstraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_caret_and_tilde() {
        let caret = VersionConstraint::parse("^0.8.0").unwrap();
        assert!(caret.matches(&v("0.8.0")));
        assert!(caret.matches(&v("0.8.2")));
        assert!(!caret.matches(&v("0.9.0")));
        assert!(!caret.matches(&v("0.7.6")));

        let tilde = VersionConstraint::parse("~0.4.13").unwrap();
        assert!(tilde.matches(&v("0.4.26")));
        assert!(!tilde.matches(&v("0.5.0")));
    }

    #[test]
    fn test_bare_version_is_exact() {
        let c = VersionConstraint::parse("0.6.6").unwrap();
        assert!(c.matches(&v("0.6.6")));
        assert!(!c.matches(&v("0.6.7")));
        assert_eq!(c.exact_version(), Some(v("0.6.6")));

        let c = VersionConstraint::parse("=0.8.2").unwrap();
        assert_eq!(c.exact_version(), Some(v("0.8.2")));
    }

    #[test]
    fn test_space_separated_range() {
        let c = VersionConstraint::parse(">=0.6.0 <0.8.0").unwrap();
        assert!(c.matches(&v("0.6.6")));
        assert!(c.matches(&v("0.7.6")));
        assert!(!c.matches(&v("0.8.0")));
        assert_eq!(c.exact_version(), None);

        let spaced = VersionConstraint::parse(">= 0.6.0 < 0.8.0").unwrap();
        assert!(spaced.matches(&v("0.7.6")));
        assert!(!spaced.matches(&v("0.5.16")));
    }

    #[test]
    fn test_alternatives_and_hyphen_ranges() {
        let c = VersionConstraint::parse("0.4.13 || ^0.8.0").unwrap();
        assert!(c.matches(&v("0.4.13")));
        assert!(c.matches(&v("0.8.2")));
        assert!(!c.matches(&v("0.6.6")));

        let c = VersionConstraint::parse("0.5.0 - 0.6.6").unwrap();
        assert!(c.matches(&v("0.5.16")));
        assert!(c.matches(&v("0.6.6")));
        assert!(!c.matches(&v("0.7.6")));
    }

    #[test]
    fn test_wildcards_and_partials() {
        let star = VersionConstraint::parse("*").unwrap();
        assert!(star.matches(&v("0.4.13")));

        let partial = VersionConstraint::parse("0.8").unwrap();
        assert!(partial.matches(&v("0.8.2")));
        assert!(!partial.matches(&v("0.7.6")));
        assert_eq!(partial.exact_version(), None);
    }

    #[test]
    fn test_intersect() {
        let a = VersionConstraint::parse(">=0.6.0").unwrap();
        let b = VersionConstraint::parse("<0.8.0").unwrap();
        let both = a.intersect(&b);
        assert!(both.matches(&v("0.7.6")));
        assert!(!both.matches(&v("0.8.0")));
        assert!(!both.matches(&v("0.5.16")));
    }

    #[test]
    fn test_invalid_constraints() {
        assert!(matches!(
            VersionConstraint::parse(""),
            Err(BuildError::InvalidConstraint { .. })
        ));
        assert!(VersionConstraint::parse("^banana").is_err());
        assert!(VersionConstraint::parse("0.5.0 -").is_err());
    }

    #[test]
    fn test_exact_constructor_round_trips_through_display() {
        let c = VersionConstraint::exact(&v("0.7.6"));
        assert_eq!(c.to_string(), "=0.7.6");
        assert_eq!(c.exact_version(), Some(v("0.7.6")));
    }
}
