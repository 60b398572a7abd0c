//! Multi-version build pipeline
//!
//! Resolves a compiler for every unit, compiles each version group on the
//! rayon pool, writes artifacts, reconciles the artifacts directory and
//! hands the artifact set to the post-processors.

use crate::artifacts::{writer, ArtifactSet, BuildArtifact, CompiledContract};
use crate::cancel::CancelHandle;
use crate::compiler::{CompilerBackend, CompilerInput, CompilerOutput, Diagnostic, InvocationError};
use crate::config::{BuildOptions, CoveragePolicy};
use crate::error::{BuildError, BuildResult};
use crate::gas::{self, GasReporter};
use crate::processors::{self, PostProcessor, ProcessContext};
use crate::registry::{CompilerProfile, CompilerRegistry};
use crate::report::{BuildPhase, BuildReport, UnitReport, UnitStatus};
use crate::resolver::{self, VersionAssignment};
use crate::source::SourceUnit;
use chrono::Utc;
use rayon::prelude::*;
use semver::Version;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Instant;

/// Collaborators of one build invocation
pub struct BuildContext<'a> {
    pub registry: &'a CompilerRegistry,
    pub compiler: &'a dyn CompilerBackend,
    pub processors: &'a [Box<dyn PostProcessor>],
    pub gas_reporter: &'a GasReporter,
    pub options: &'a BuildOptions,
}

/// Result of a build that got past resolution
#[derive(Debug)]
pub struct BuildOutcome {
    pub report: BuildReport,
    pub artifacts: ArtifactSet,
}

/// Build `units`
///
/// Registry and resolution problems abort with an error before anything is
/// compiled. Compilation failures are collected per unit in the report; the
/// build only counts as failed when no unit compiled.
pub fn build(
    ctx: &BuildContext<'_>,
    units: &[SourceUnit],
    cancel: &CancelHandle,
) -> BuildResult<BuildOutcome> {
    let mut report = BuildReport::new(Utc::now());
    let mut phase = BuildPhase::Pending;
    let artifacts = ArtifactSet::new();

    phase.advance(BuildPhase::Resolving);
    let assignments = resolver::resolve(units, ctx.registry, &ctx.options.overrides)?;
    check_coverage(ctx, &assignments, &mut report)?;

    phase.advance(BuildPhase::Compiling);
    let groups: Vec<(&CompilerProfile, Vec<&SourceUnit>)> =
        resolver::group_by_version(&assignments)
            .into_values()
            .map(|group| (group[0].profile, group.iter().map(|a| a.unit).collect()))
            .collect();
    tracing::info!(
        "Compiling {} unit(s) with {} compiler version(s)",
        units.len(),
        groups.len()
    );

    let outcomes = groups
        .par_iter()
        .map(|(profile, group)| compile_group(ctx, profile, group, &artifacts, cancel))
        .collect::<BuildResult<Vec<_>>>()?;

    let mut written = BTreeSet::new();
    let mut cancelled = cancel.is_cancelled();
    for outcome in outcomes {
        cancelled |= outcome.cancelled;
        written.extend(outcome.written);
        report.units.extend(outcome.reports);
    }
    report.units.sort_by(|a, b| a.unit.cmp(&b.unit));

    if cancelled {
        tracing::warn!("Build cancelled, skipping post-processing and output reconciliation");
        report.processors = processors::skip_all(ctx.processors, "build cancelled");
        report.finish(true);
        phase.advance(report.status.into());
        return Ok(BuildOutcome { report, artifacts });
    }

    // Failed units keep their previous artifacts until they build again
    let preserve: Vec<PathBuf> = report
        .units
        .iter()
        .filter(|u| u.status == UnitStatus::Failed)
        .map(|u| writer::unit_dir(&ctx.options.artifacts_dir, &u.unit))
        .collect();
    report.removed = writer::reconcile(&ctx.options.artifacts_dir, &written, &preserve)?;
    if !report.removed.is_empty() {
        tracing::info!("Removed {} stale artifact file(s)", report.removed.len());
    }

    if !ctx.options.post_process {
        report.processors = processors::skip_all(ctx.processors, "post-processing disabled");
    } else if !report.units.is_empty() && report.count(UnitStatus::Succeeded) == 0 {
        report.processors = processors::skip_all(ctx.processors, "no unit compiled");
    } else {
        phase.advance(BuildPhase::PostProcessing);
        let requested = &ctx.options.requested_processors;
        for name in processors::unknown_requests(ctx.processors, requested) {
            report
                .warnings
                .push(format!("Unknown post-processor '{name}' requested"));
        }
        let process_ctx = ProcessContext {
            project_root: &ctx.options.project_root,
            units,
            artifacts: &artifacts,
        };
        report.processors =
            processors::run_processors(ctx.processors, requested, &process_ctx, cancel);
        report.warnings.extend(artifacts.warnings());
    }

    if ctx.gas_reporter.is_enabled() {
        report.gas = ctx.gas_reporter.rows(ctx.options.network_gas_price);
    }

    report.finish(cancel.is_cancelled());
    phase.advance(report.status.into());
    tracing::info!("{}", report.summary());
    Ok(BuildOutcome { report, artifacts })
}

/// Surface optimizer-enabled profiles when coverage instrumentation will run
fn check_coverage(
    ctx: &BuildContext<'_>,
    assignments: &[VersionAssignment<'_>],
    report: &mut BuildReport,
) -> BuildResult<()> {
    if !ctx.options.post_process {
        return Ok(());
    }
    let wants_unoptimized = ctx.processors.iter().any(|p| {
        p.requires_unoptimized()
            && processors::is_selected(p.as_ref(), &ctx.options.requested_processors)
    });
    if !wants_unoptimized {
        return Ok(());
    }

    let optimized: BTreeSet<&Version> = assignments
        .iter()
        .filter(|a| a.profile.optimizer.enabled)
        .map(|a| &a.profile.version)
        .collect();
    if optimized.is_empty() {
        return Ok(());
    }

    let versions: Vec<String> = optimized.iter().map(|v| v.to_string()).collect();
    match ctx.options.coverage_policy {
        CoveragePolicy::Reject => Err(BuildError::CoverageConflict { versions }),
        CoveragePolicy::Warn => {
            let warning = format!(
                "Coverage instrumentation with optimizer-enabled compilers ({}): source ranges may be imprecise",
                versions.join(", ")
            );
            tracing::warn!("{}", warning);
            report.warnings.push(warning);
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
struct GroupOutcome {
    reports: Vec<UnitReport>,
    written: Vec<PathBuf>,
    cancelled: bool,
}

/// Compile one version group and write its artifacts once the group is done
fn compile_group(
    ctx: &BuildContext<'_>,
    profile: &CompilerProfile,
    units: &[&SourceUnit],
    artifacts: &ArtifactSet,
    cancel: &CancelHandle,
) -> BuildResult<GroupOutcome> {
    let started = Instant::now();
    let version = profile.version.to_string();

    let results = match compile_batch(ctx.compiler, profile, units, cancel) {
        Ok(results) => results,
        Err(Interrupted) => {
            tracing::info!(
                "solc {}: cancelled, discarding {} unit(s)",
                version,
                units.len()
            );
            let reports = units
                .iter()
                .map(|unit| UnitReport {
                    unit: unit.id.clone(),
                    compiler_version: version.clone(),
                    status: UnitStatus::Skipped,
                    contracts: vec![],
                    diagnostics: vec![],
                })
                .collect();
            return Ok(GroupOutcome {
                reports,
                written: vec![],
                cancelled: true,
            });
        }
    };

    let mut outcome = GroupOutcome::default();
    for (unit, result) in results {
        match result {
            UnitResult::Built(artifact) => {
                outcome
                    .written
                    .extend(writer::write_artifact(&ctx.options.artifacts_dir, &artifact)?);
                record_gas(ctx.gas_reporter, &artifact);
                outcome.reports.push(UnitReport {
                    unit,
                    compiler_version: version.clone(),
                    status: UnitStatus::Succeeded,
                    contracts: artifact.contracts.keys().cloned().collect(),
                    diagnostics: artifact.diagnostics.clone(),
                });
                artifacts.insert(artifact);
            }
            UnitResult::Failed(diagnostics) => {
                tracing::warn!("{} failed to compile with solc {}", unit, version);
                outcome.reports.push(UnitReport {
                    unit,
                    compiler_version: version.clone(),
                    status: UnitStatus::Failed,
                    contracts: vec![],
                    diagnostics,
                });
            }
        }
    }

    let failed = outcome
        .reports
        .iter()
        .filter(|r| r.status == UnitStatus::Failed)
        .count();
    tracing::info!(
        "solc {}: {} unit(s) compiled, {} failed in {:.2}s",
        version,
        outcome.reports.len() - failed,
        failed,
        started.elapsed().as_secs_f64()
    );
    Ok(outcome)
}

/// Marker for a compiler invocation stopped by cancellation
struct Interrupted;

enum UnitResult {
    Built(BuildArtifact),
    Failed(Vec<Diagnostic>),
}

/// Compile `units` in one invocation, falling back to one invocation per
/// unit for units a failed batch gives no error of their own
fn compile_batch(
    compiler: &dyn CompilerBackend,
    profile: &CompilerProfile,
    units: &[&SourceUnit],
    cancel: &CancelHandle,
) -> Result<Vec<(String, UnitResult)>, Interrupted> {
    if cancel.is_cancelled() {
        return Err(Interrupted);
    }

    let input = units.iter().fold(CompilerInput::new(), |input, unit| {
        input.with_source(unit.id.as_str(), unit.content.as_str())
    });

    let output = match compiler.compile(profile, &input, cancel) {
        Ok(output) => output,
        Err(InvocationError::Cancelled) => return Err(Interrupted),
        // A missing binary fails every unit the same way
        Err(e @ InvocationError::Spawn { .. }) => {
            let diagnostic = Diagnostic::tool_error(e.to_string());
            return Ok(units
                .iter()
                .map(|unit| (unit.id.clone(), UnitResult::Failed(vec![diagnostic.clone()])))
                .collect());
        }
        Err(e) if units.len() > 1 => {
            tracing::warn!(
                "solc {} failed on a batch of {} units, retrying individually: {}",
                profile.version,
                units.len(),
                e
            );
            return compile_individually(compiler, profile, units, cancel);
        }
        Err(e) => {
            return Ok(vec![(
                units[0].id.clone(),
                UnitResult::Failed(vec![Diagnostic::tool_error(e.to_string())]),
            )]);
        }
    };

    if !output.has_errors() {
        return Ok(units
            .iter()
            .map(|unit| (unit.id.clone(), UnitResult::Built(extract_artifact(unit, profile, &output))))
            .collect());
    }

    let mut results = Vec::new();
    let mut unattributed = Vec::new();
    for unit in units {
        let own: Vec<Diagnostic> = output
            .errors
            .iter()
            .filter(|d| d.file() == Some(unit.id.as_str()))
            .cloned()
            .collect();
        if own.iter().any(Diagnostic::is_error) {
            results.push((unit.id.clone(), UnitResult::Failed(own)));
        } else {
            unattributed.push(*unit);
        }
    }

    if unattributed.is_empty() {
        return Ok(results);
    }
    if units.len() == 1 {
        // The error sits in an imported file or has no location
        let errors = output.errors.iter().filter(|d| d.is_error()).cloned().collect();
        return Ok(vec![(units[0].id.clone(), UnitResult::Failed(errors))]);
    }

    tracing::debug!(
        "solc {}: recompiling {} unit(s) without errors of their own",
        profile.version,
        unattributed.len()
    );
    results.extend(compile_individually(compiler, profile, &unattributed, cancel)?);
    Ok(results)
}

fn compile_individually(
    compiler: &dyn CompilerBackend,
    profile: &CompilerProfile,
    units: &[&SourceUnit],
    cancel: &CancelHandle,
) -> Result<Vec<(String, UnitResult)>, Interrupted> {
    let mut results = Vec::with_capacity(units.len());
    for unit in units {
        results.extend(compile_batch(compiler, profile, std::slice::from_ref(unit), cancel)?);
    }
    Ok(results)
}

fn extract_artifact(unit: &SourceUnit, profile: &CompilerProfile, output: &CompilerOutput) -> BuildArtifact {
    let contracts = output
        .contracts
        .get(&unit.id)
        .map(|contracts| {
            contracts
                .iter()
                .map(|(name, contract)| {
                    (
                        name.clone(),
                        CompiledContract::from_output(name, contract.clone(), unit, profile),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    BuildArtifact {
        unit: unit.id.clone(),
        compiler_version: profile.version.clone(),
        contracts,
        source_ids: output.source_ids(),
        diagnostics: output
            .errors
            .iter()
            .filter(|d| d.file() == Some(unit.id.as_str()))
            .cloned()
            .collect(),
    }
}

fn record_gas(reporter: &GasReporter, artifact: &BuildArtifact) {
    if !reporter.is_enabled() {
        return;
    }
    for contract in artifact.contracts.values().filter(|c| c.is_deployable()) {
        // Unlinked code has no meaningful size yet
        let Ok(code) = contract.bytecode.to_bytes() else {
            continue;
        };
        let estimate = gas::estimate_deployment_gas(&code, contract.deployed_bytecode.size());
        reporter.record(&format!("{}:{}", artifact.unit, contract.name), estimate);
    }
}
