//! Post-processors run over a completed artifact set
//!
//! Processors execute in ascending `order`. Processors sharing an order run
//! concurrently on the rayon pool; a failing processor is reported and never
//! stops the others. Two processors writing to the same output location are
//! serialized by a per-location lock.

use crate::artifacts::{ArtifactSet, GeneratedOutput};
use crate::cancel::CancelHandle;
use crate::report::{ProcessorReport, ProcessorStatus};
use crate::source::SourceUnit;
use eyre::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use walkdir::WalkDir;

pub mod bindings;
pub mod coverage;
pub mod docgen;
pub mod license;

pub use bindings::{BindingTarget, TypeBindingGenerator};
pub use coverage::CoverageInstrumenter;
pub use docgen::DocumentationGenerator;
pub use license::LicenseHeaderInjector;

/// Everything a processor may read, plus the artifact set it appends to
pub struct ProcessContext<'a> {
    pub project_root: &'a Path,
    pub units: &'a [SourceUnit],
    pub artifacts: &'a ArtifactSet,
}

impl ProcessContext<'_> {
    /// Whether `unit` is still part of the source set
    pub fn has_unit(&self, unit: &str) -> bool {
        self.units.iter().any(|u| u.id == unit) || self.artifacts.get(unit).is_some()
    }

    /// Units in the source set without an artifact from this run
    ///
    /// Their previous outputs stay until they compile again.
    pub fn retained_units(&self) -> Vec<&str> {
        self.units
            .iter()
            .map(|u| u.id.as_str())
            .filter(|id| self.artifacts.get(id).is_none())
            .collect()
    }
}

/// Header text marking a file generated for `unit`
pub(crate) fn generated_marker(unit: &str) -> String {
    format!("Generated by contract-builder from {unit}. Do not edit.")
}

/// Unit named by the generated-file marker near the top of `path`
pub(crate) fn generated_from(path: &Path) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    BufReader::new(file)
        .lines()
        .take(3)
        .map_while(std::io::Result::ok)
        .find_map(|line| {
            let (_, rest) = line.split_once("Generated by contract-builder from ")?;
            let (unit, _) = rest.split_once(". Do not edit.")?;
            Some(unit.to_string())
        })
}

/// Files below `dir` paired with the unit they were generated for, if any
pub(crate) fn existing_outputs(dir: &Path) -> Vec<(PathBuf, Option<String>)> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let unit = generated_from(entry.path());
            (entry.into_path(), unit)
        })
        .collect()
}

/// A transform over the completed artifact set
///
/// `process` must be idempotent: running it twice over the same artifacts
/// leaves the output location as running it once.
pub trait PostProcessor: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Lower orders run first
    fn order(&self) -> i32;

    /// Whether the processor runs automatically after every build
    fn run_on_build(&self) -> bool;

    /// Directory this processor writes to
    fn output_location(&self) -> &Path;

    /// Whether the processor rewrites sources in place instead of owning
    /// its output location
    fn edits_sources(&self) -> bool {
        false
    }

    /// Whether the processor needs unoptimized compiler output
    fn requires_unoptimized(&self) -> bool {
        false
    }

    /// Run the processor, returning the files it wrote or changed
    fn process(&self, ctx: &ProcessContext<'_>) -> Result<Vec<PathBuf>>;
}

/// Processor declaration in `builder.toml`
///
/// ```toml
/// [[processors]]
/// kind = "docgen"
/// path = "docs/contracts"
/// except = ["^contracts/interfaces"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProcessorConfig {
    TypeBindings(bindings::BindingsConfig),
    License(license::LicenseConfig),
    Docgen(docgen::DocgenConfig),
    Coverage(coverage::CoverageConfig),
}

impl ProcessorConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::TypeBindings(c) => c.name.as_deref().unwrap_or("type-bindings"),
            Self::License(c) => c.name.as_deref().unwrap_or("license"),
            Self::Docgen(c) => c.name.as_deref().unwrap_or("docgen"),
            Self::Coverage(c) => c.name.as_deref().unwrap_or("coverage"),
        }
    }

    /// Instantiate the processor, resolving relative paths against `project_root`
    ///
    /// The license injector works on sources in place, so it gets `sources_dir`
    /// as its output location.
    pub fn into_processor(
        self,
        project_root: &Path,
        sources_dir: &Path,
    ) -> Result<Box<dyn PostProcessor>> {
        let name = self.name().to_string();
        let processor: Box<dyn PostProcessor> = match self {
            Self::TypeBindings(c) => Box::new(TypeBindingGenerator::new(name, c, project_root)),
            Self::License(c) => Box::new(LicenseHeaderInjector::new(name, c, sources_dir)),
            Self::Docgen(c) => Box::new(DocumentationGenerator::new(name, c, project_root)?),
            Self::Coverage(c) => Box::new(CoverageInstrumenter::new(name, c, project_root)),
        };
        Ok(processor)
    }
}

pub(crate) fn resolve_dir(project_root: &Path, dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        project_root.join(dir)
    }
}

/// Exclusive locks keyed by output location
#[derive(Debug, Default)]
pub struct OutputLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl OutputLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock for `location`, created on first use
    pub fn lock_for(&self, location: &Path) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(location.to_path_buf())
            .or_default()
            .clone()
    }
}

/// Whether `processor` runs in this invocation
pub fn is_selected(processor: &dyn PostProcessor, requested: &[String]) -> bool {
    processor.run_on_build() || requested.iter().any(|r| r == processor.name())
}

/// Requested names that match no configured processor
pub fn unknown_requests<'a>(
    processors: &[Box<dyn PostProcessor>],
    requested: &'a [String],
) -> Vec<&'a str> {
    requested
        .iter()
        .filter(|r| !processors.iter().any(|p| p.name() == r.as_str()))
        .map(String::as_str)
        .collect()
}

/// Run the selected processors order group by order group
///
/// Reports come back in execution order. Processors that were not selected,
/// or whose group was reached after cancellation, are reported as skipped.
pub fn run_processors(
    processors: &[Box<dyn PostProcessor>],
    requested: &[String],
    ctx: &ProcessContext<'_>,
    cancel: &CancelHandle,
) -> Vec<ProcessorReport> {
    let mut groups: BTreeMap<i32, Vec<&dyn PostProcessor>> = BTreeMap::new();
    for processor in processors {
        groups
            .entry(processor.order())
            .or_default()
            .push(processor.as_ref());
    }

    let locks = OutputLocks::new();
    let mut reports = Vec::with_capacity(processors.len());

    for (order, group) in groups {
        if cancel.is_cancelled() {
            reports.extend(group.iter().map(|p| skipped(*p, "build cancelled")));
            continue;
        }

        tracing::debug!("Running post-processors with order {}", order);
        let results: Vec<ProcessorReport> = group
            .par_iter()
            .map(|processor| {
                if !is_selected(*processor, requested) {
                    return skipped(*processor, "not run on build and not requested");
                }
                run_one(*processor, ctx, &locks)
            })
            .collect();
        reports.extend(results);
    }

    reports
}

/// Report every processor as skipped for `reason`
pub fn skip_all(processors: &[Box<dyn PostProcessor>], reason: &str) -> Vec<ProcessorReport> {
    let mut reports: Vec<ProcessorReport> = processors
        .iter()
        .map(|p| skipped(p.as_ref(), reason))
        .collect();
    reports.sort_by_key(|r| r.order);
    reports
}

fn run_one(processor: &dyn PostProcessor, ctx: &ProcessContext<'_>, locks: &OutputLocks) -> ProcessorReport {
    let lock = locks.lock_for(processor.output_location());
    let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

    let status = match processor.process(ctx) {
        Ok(outputs) => {
            tracing::info!(
                "Post-processor {} wrote {} file(s) to {}",
                processor.name(),
                outputs.len(),
                processor.output_location().display()
            );
            for path in &outputs {
                ctx.artifacts.record_output(GeneratedOutput {
                    processor: processor.name().to_string(),
                    unit: None,
                    path: path.clone(),
                });
            }
            ProcessorStatus::Succeeded { outputs }
        }
        Err(e) => {
            tracing::warn!("Post-processor {} failed: {:#}", processor.name(), e);
            ProcessorStatus::Failed {
                error: format!("{e:#}"),
            }
        }
    };

    ProcessorReport {
        name: processor.name().to_string(),
        order: processor.order(),
        status,
    }
}

fn skipped(processor: &dyn PostProcessor, reason: &str) -> ProcessorReport {
    ProcessorReport {
        name: processor.name().to_string(),
        order: processor.order(),
        status: ProcessorStatus::Skipped {
            reason: reason.to_string(),
        },
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Processor that appends its name to a shared log and optionally fails
    #[derive(Debug)]
    pub struct Recorder {
        pub name: String,
        pub order: i32,
        pub run_on_build: bool,
        pub fail: bool,
        pub location: PathBuf,
        pub log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        pub fn new(name: &str, order: i32, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                order,
                run_on_build: true,
                fail: false,
                location: PathBuf::from(format!("out/{name}")),
                log: log.clone(),
            }
        }
    }

    impl PostProcessor for Recorder {
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
            &self.location
        }

        fn process(&self, _ctx: &ProcessContext<'_>) -> Result<Vec<PathBuf>> {
            self.log.lock().unwrap().push(self.name.clone());
            if self.fail {
                eyre::bail!("{} exploded", self.name);
            }
            Ok(vec![self.location.join("out.txt")])
        }
    }
}
