//! Railyard - convergent release deployment CLI
//!
//! The `railyard` command provisions the deploy account, renders the
//! application's configuration and cuts releases on the local host.
//!
//! ## Commands
//!
//! - `validate`: Check a configuration file
//! - `bootstrap`: Create the deploy account and publish its key
//! - `deploy`: Run a full deployment
//! - `rollback`: Return `current` to the previous release
//! - `releases`: List release directories

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn, Level};

use railyard_core::{
    CancelSignal, DeployAction, DeployConfig, DeployReport, Deployer, NodeStatus, Release,
    RunReport, StageOutcome,
};
use railyard_exec::host_collaborators;

#[derive(Parser)]
#[command(name = "railyard")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Convergent release deployment for web application hosts", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and reports
    #[arg(long, global = true)]
    json: bool,

    /// Deployment configuration (JSON)
    #[arg(
        short,
        long,
        global = true,
        env = "RAILYARD_CONFIG",
        default_value = "railyard.json"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the configuration without touching the host
    Validate,

    /// Create the deploy account and publish its SSH key
    Bootstrap,

    /// Bootstrap, render configuration and cut a release
    Deploy {
        /// Cut a new release even if the revision is already current
        #[arg(long)]
        force: bool,

        /// Revision to deploy instead of the configured one
        #[arg(long)]
        revision: Option<String>,
    },

    /// Return `current` to the release before it
    Rollback,

    /// List release directories, oldest first
    Releases,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    railyard_core::init_tracing(cli.json, level);

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate => cmd_validate(&config),
        Commands::Bootstrap => cmd_bootstrap(config, cli.json).await,
        Commands::Deploy { force, revision } => {
            let action = if force {
                DeployAction::ForceDeploy
            } else {
                DeployAction::Deploy
            };
            cmd_deploy(config, action, revision, cli.json).await
        }
        Commands::Rollback => cmd_deploy(config, DeployAction::Rollback, None, cli.json).await,
        Commands::Releases => cmd_releases(config, cli.json),
    }
}

fn load_config(path: &Path) -> Result<DeployConfig> {
    DeployConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

/// A signal that trips on Ctrl-C.
fn cancel_on_ctrl_c() -> CancelSignal {
    let cancel = CancelSignal::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping at the next step boundary");
            trip.cancel();
        }
    });
    cancel
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Check a configuration file
fn cmd_validate(config: &DeployConfig) -> Result<()> {
    config.validate()?;
    println!(
        "Configuration OK: {} -> {}",
        config.app.name,
        config.app.path.display()
    );
    Ok(())
}

/// Provision the deploy account only
async fn cmd_bootstrap(config: DeployConfig, json: bool) -> Result<()> {
    let collaborators = host_collaborators(&config);
    let deployer = Deployer::new(config, collaborators);
    let report = deployer.bootstrap(&cancel_on_ctrl_c()).await?;
    if json {
        return print_json(&report);
    }
    print_graph("bootstrap", &report);
    Ok(())
}

/// Run a deployment or rollback
async fn cmd_deploy(
    config: DeployConfig,
    action: DeployAction,
    revision: Option<String>,
    json: bool,
) -> Result<()> {
    let collaborators = host_collaborators(&config);
    let mut deployer = Deployer::new(config, collaborators).with_action(action);
    if let Some(revision) = revision {
        deployer = deployer.with_revision(revision);
    }
    info!(app = %deployer.config().app.name, action = ?action, "railyard starting");

    let report = deployer.run(&cancel_on_ctrl_c()).await;
    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    match report.error {
        Some(error) => bail!("Deployment failed: {}", error),
        None => Ok(()),
    }
}

/// List releases
fn cmd_releases(config: DeployConfig, json: bool) -> Result<()> {
    let collaborators = host_collaborators(&config);
    let entries = Deployer::new(config, collaborators).workflow().releases()?;
    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No releases found");
        return Ok(());
    }
    for entry in entries {
        let marker = if entry.current { "*" } else { " " };
        println!(
            "{} {}  {}",
            marker,
            entry.path.display(),
            entry.revision.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Human-readable output
// ---------------------------------------------------------------------------

fn print_report(report: &DeployReport) {
    if !report.bootstrap.is_empty() {
        print_graph("bootstrap", &report.bootstrap);
    }
    if !report.prepare.is_empty() {
        print_graph("prepare", &report.prepare);
    }
    if let Some(release) = &report.release {
        print_release(release);
    }
    if report.deferred_restart {
        println!("Application restarted for configuration changes");
    }
    if let Some(error) = &report.error {
        println!("Error: {}", error);
    }
}

fn print_graph(label: &str, report: &RunReport) {
    let changed = report.changed().len();
    let skipped = report
        .nodes
        .iter()
        .filter(|n| n.status == NodeStatus::SkippedNoOp)
        .count();
    println!("{}: {} changed, {} up to date", label, changed, skipped);
    for node in report.nodes.iter().filter(|n| n.status != NodeStatus::NotRun) {
        println!("  {:<24} {}", node.name, status_label(node.status));
    }
    if let Some(failure) = &report.failure {
        println!("  failed at {}: {}", failure.node, failure.cause);
    }
}

fn status_label(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Succeeded => "changed",
        NodeStatus::SkippedNoOp => "ok",
        NodeStatus::Failed => "FAILED",
        NodeStatus::NotRun => "not run",
    }
}

fn print_release(release: &Release) {
    println!(
        "release {}: {:?}",
        release.revision,
        release.outcome
    );
    if let Some(commit) = &release.resolved_revision {
        println!("  revision  {}", commit);
    }
    if let Some(path) = &release.current_target {
        println!("  current   {}", path.display());
    }
    for record in &release.stages {
        let outcome = match &record.outcome {
            StageOutcome::Succeeded => "done".to_string(),
            StageOutcome::Skipped { reason } => format!("skipped ({})", reason),
            StageOutcome::Failed { cause } => format!("FAILED: {}", cause),
        };
        println!("  {:<16} {}", record.stage.to_string(), outcome);
    }
}
