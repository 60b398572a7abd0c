//! CLI for the contract-builder library
//!
//! Builds multi-version Solidity projects and checks deployed bytecode.

use clap::{Parser, Subcommand};
use contract_builder::{
    blockchain, find_contract, BuildError, BuildOutcome, BuildReport, BuildStatus, BytecodeMatch,
    CancelHandle, NetworkTarget, ProcessorStatus, Project, UnitStatus, CONFIG_FILE,
};
use eyre::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::Level;

/// Multi-version Solidity build orchestrator
#[derive(Parser, Debug)]
#[command(name = "contract-builder")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the project manifest
    #[arg(short, long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Output JSON to stdout
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all logging except errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile every source unit and run the post-processors
    Build {
        /// Also run a post-processor that does not run on build (repeatable)
        #[arg(short, long = "processor")]
        processors: Vec<String>,
    },

    /// Show the compiler chosen for each source unit without compiling
    Resolve,

    /// List configured network targets
    Networks,

    /// Compare a compiled contract with the code deployed on a network
    Verify {
        /// Contract name, or `path/to/Unit.sol:Name`
        #[arg(long)]
        contract: String,

        /// Contract address
        #[arg(long)]
        address: String,

        /// Network target; the configured default when omitted
        #[arg(long)]
        network: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "status")]
enum Output<'a> {
    #[serde(rename = "success")]
    Success {
        #[serde(flatten)]
        data: SuccessData<'a>,
    },

    #[serde(rename = "error")]
    Error { error_type: String, message: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "command")]
enum SuccessData<'a> {
    #[serde(rename = "build")]
    Build { report: &'a BuildReport },

    #[serde(rename = "resolve")]
    Resolve {
        units: Vec<ResolvedUnit>,
        test_timeout_ms: u64,
        tests_dir: String,
    },

    #[serde(rename = "networks")]
    Networks {
        networks: Vec<&'a NetworkTarget>,
        #[serde(skip_serializing_if = "Option::is_none")]
        default_network: Option<&'a str>,
    },

    #[serde(rename = "verify")]
    Verify {
        verified: bool,
        contract_name: String,
        network: String,
        chain_id: u64,
        address: String,
        result: BytecodeMatch,
    },
}

#[derive(Debug, Serialize)]
struct ResolvedUnit {
    unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    constraint: Option<String>,
    compiler_version: String,
    optimizer: bool,
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.quiet {
        Level::ERROR
    } else if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Build { processors } => run_build(&cli.config, processors, cli.json),
        Commands::Resolve => run_resolve(&cli.config, cli.json),
        Commands::Networks => run_networks(&cli.config, cli.json),
        Commands::Verify {
            contract,
            address,
            network,
        } => run_verify(&cli.config, contract, address, network, cli.json),
    };

    match result {
        Ok(code) if code != 0 => std::process::exit(code),
        Ok(_) => {}
        Err(e) => {
            output_error(e, cli.json);
            std::process::exit(1);
        }
    }
}

/// Work done after compiling
enum BuildMode {
    /// Run-on-build processors plus the requested ones
    Full(Vec<String>),
    /// Artifacts only; sources and generated outputs stay untouched
    CompileOnly,
}

/// Build on a blocking worker while Ctrl-C cancels it
fn build_with_interrupt(project: Project, mode: BuildMode) -> Result<(Project, BuildOutcome)> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
    runtime.block_on(async move {
        let cancel = CancelHandle::new();

        let handle = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling build");
                handle.cancel();
            }
        });

        tokio::task::spawn_blocking(move || -> Result<(Project, BuildOutcome)> {
            let outcome = match &mode {
                BuildMode::Full(requested) => project.build(requested, &cancel)?,
                BuildMode::CompileOnly => project.compile_only(&cancel)?,
            };
            Ok((project, outcome))
        })
        .await
        .context("Build task panicked")?
    })
}

fn run_build(config: &Path, requested: Vec<String>, json: bool) -> Result<i32> {
    let project = Project::load(config)?;
    let (project, outcome) = build_with_interrupt(project, BuildMode::Full(requested))?;
    let report = &outcome.report;

    if json {
        let output = Output::Success {
            data: SuccessData::Build { report },
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        print_report(&project, report);
    }

    Ok(match report.status {
        BuildStatus::Completed => 0,
        BuildStatus::Failed => 1,
        BuildStatus::Cancelled => 130,
    })
}

fn print_report(project: &Project, report: &BuildReport) {
    let icon = match report.status {
        BuildStatus::Completed => "✅",
        BuildStatus::Failed => "❌",
        BuildStatus::Cancelled => "⚠️ ",
    };
    println!("{} {}", icon, report.summary());

    for unit in &report.units {
        match unit.status {
            UnitStatus::Succeeded => {
                println!("   - {} (solc {}): {}", unit.unit, unit.compiler_version, unit.contracts.join(", "));
            }
            UnitStatus::Failed => {
                println!("   ✗ {} (solc {})", unit.unit, unit.compiler_version);
                for diagnostic in unit.diagnostics.iter().filter(|d| d.is_error()) {
                    let text = diagnostic.formatted_message.as_deref().unwrap_or(&diagnostic.message);
                    println!("       {}", text.trim_end().replace('\n', "\n       "));
                }
            }
            UnitStatus::Skipped => {
                println!("   ~ {} (skipped)", unit.unit);
            }
        }
    }

    if !report.processors.is_empty() {
        println!("📄 Post-processors:");
        for processor in &report.processors {
            match &processor.status {
                ProcessorStatus::Succeeded { outputs } => {
                    println!("   - {}: {} file(s)", processor.name, outputs.len());
                }
                ProcessorStatus::Failed { error } => {
                    println!("   ✗ {}: {}", processor.name, error);
                }
                ProcessorStatus::Skipped { reason } => {
                    println!("   ~ {}: skipped ({})", processor.name, reason);
                }
            }
        }
    }

    for warning in &report.warnings {
        println!("⚠️  {}", warning);
    }

    if project.gas_reporter.is_enabled() && !report.gas.is_empty() {
        println!();
        print!("{}", project.gas_reporter.render(project.network_gas_price()));
    }
}

fn run_resolve(config: &Path, json: bool) -> Result<i32> {
    let project = Project::load(config)?;
    let units = project.sources()?;
    let assignments = project.resolve(&units)?;

    let resolved: Vec<ResolvedUnit> = assignments
        .iter()
        .map(|a| ResolvedUnit {
            unit: a.unit.id.clone(),
            constraint: a.unit.declared_version.as_ref().map(|c| c.to_string()),
            compiler_version: a.profile.version.to_string(),
            optimizer: a.profile.optimizer.enabled,
        })
        .collect();

    if json {
        let output = Output::Success {
            data: SuccessData::Resolve {
                units: resolved,
                test_timeout_ms: project.config.test_runner.timeout_ms,
                tests_dir: project.config.tests_dir().display().to_string(),
            },
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("🔍 Resolved {} unit(s):", resolved.len());
        for unit in &resolved {
            println!(
                "   - {} -> solc {}{}",
                unit.unit,
                unit.compiler_version,
                if unit.optimizer { " (optimized)" } else { "" }
            );
        }
    }
    Ok(0)
}

fn run_networks(config: &Path, json: bool) -> Result<i32> {
    let project = Project::load(config)?;
    let networks: Vec<&NetworkTarget> = project.networks.iter().collect();
    let default_network = project.config.default_network.as_deref();

    if json {
        let output = Output::Success {
            data: SuccessData::Networks {
                networks,
                default_network,
            },
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        for network in networks {
            let marker = if Some(network.name.as_str()) == default_network { " (default)" } else { "" };
            println!("🌐 {}{}", network.name, marker);
            println!("   URL: {}", network.url);
            println!("   Chain ID: {}", network.chain_id);
            println!("   Gas price: {} wei", network.gas_price);
        }
    }
    Ok(0)
}

fn run_verify(
    config: &Path,
    contract: String,
    address: String,
    network: Option<String>,
    json: bool,
) -> Result<i32> {
    let project = Project::load(config)?;
    let target = project.networks.resolve(network.as_deref())?.clone();

    let (_, outcome) = build_with_interrupt(project, BuildMode::CompileOnly)?;
    if outcome.report.status == BuildStatus::Cancelled {
        return Err(BuildError::Cancelled.into());
    }
    let compiled = find_contract(&outcome.artifacts, &contract)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
    let result = runtime
        .block_on(blockchain::ethers::verify_deployed(&target, &address, &compiled))
        .context("Verification failed")?;
    let verified = result.is_match();

    if json {
        let output = Output::Success {
            data: SuccessData::Verify {
                verified,
                contract_name: compiled.name.clone(),
                network: target.name.clone(),
                chain_id: target.chain_id,
                address: address.clone(),
                result,
            },
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        match &result {
            BytecodeMatch::Exact => println!("✅ {} matches the code at {}", compiled.name, address),
            BytecodeMatch::IgnoringMetadata => println!(
                "✅ {} matches the code at {} (metadata differs)",
                compiled.name, address
            ),
            BytecodeMatch::Mismatch { expected, actual } => {
                println!("❌ Verification failed for {}", compiled.name);
                println!("\n🔍 Hash comparison:");
                println!("   Expected: {}", expected);
                println!("   Actual:   {}", actual);
            }
        }
        println!("\n📋 Contract details:");
        println!("   Address: {}", address);
        println!("   Network: {} (chain ID {})", target.name, target.chain_id);
    }

    Ok(if verified { 0 } else { 1 })
}

fn output_error(error: eyre::Report, json: bool) {
    if !json {
        eprintln!("❌ {:#}", error);
        return;
    }

    let error_type = error
        .downcast_ref::<BuildError>()
        .map(BuildError::kind)
        .unwrap_or_else(|| {
            if error.to_string().contains("Failed to fetch") {
                "network_error"
            } else if error.to_string().contains("config") {
                "config_error"
            } else {
                "unknown_error"
            }
        });

    let output = Output::Error {
        error_type: error_type.to_string(),
        message: format!("{:#}", error),
    };

    match serde_json::to_string(&output) {
        Ok(text) => eprintln!("{}", text),
        Err(_) => eprintln!("{:#}", error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["contract-builder", "build"]);
        assert!(matches!(cli.command, Commands::Build { .. }));
        assert_eq!(cli.config, PathBuf::from("builder.toml"));

        let cli = Cli::parse_from(["contract-builder", "resolve", "--json"]);
        assert!(matches!(cli.command, Commands::Resolve));
        assert!(cli.json);

        let cli = Cli::parse_from([
            "contract-builder",
            "verify",
            "--contract",
            "contracts/Token.sol:Token",
            "--address",
            "0x123",
            "--network",
            "bsc_testnet",
        ]);
        assert!(matches!(
            cli.command,
            Commands::Verify { ref network, .. } if network.as_deref() == Some("bsc_testnet")
        ));
    }

    #[test]
    fn test_requested_processors() {
        let cli = Cli::parse_from([
            "contract-builder",
            "--config",
            "project/builder.toml",
            "build",
            "-p",
            "docgen",
            "--processor",
            "coverage",
        ]);

        assert_eq!(cli.config, PathBuf::from("project/builder.toml"));
        if let Commands::Build { processors } = cli.command {
            assert_eq!(processors, vec!["docgen", "coverage"]);
        } else {
            panic!("expected build command");
        }
    }

    #[test]
    fn test_resolve_and_networks_commands() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = temp.path().join(CONFIG_FILE);
        std::fs::write(
            &config,
            "default_network = \"local\"\n[[compilers]]\nversion = \"0.8.2\"\n",
        )
        .unwrap();
        std::fs::create_dir_all(temp.path().join("contracts")).unwrap();
        std::fs::write(
            temp.path().join("contracts/A.sol"),
            "pragma solidity ^0.8.0;\ncontract A {}\n",
        )
        .unwrap();

        assert_eq!(run_resolve(&config, true).unwrap(), 0);
        assert_eq!(run_networks(&config, false).unwrap(), 0);
        assert!(run_resolve(&temp.path().join("missing.toml"), true).is_err());
    }

    #[test]
    fn test_error_output_kind() {
        let report: eyre::Report = BuildError::UnknownNetwork("ropsten".into()).into();
        assert_eq!(
            report.downcast_ref::<BuildError>().map(BuildError::kind),
            Some("unknown_network")
        );
    }
}
