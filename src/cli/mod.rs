//! Command-line interface for shipyard.
//!
//! Provides commands for deploying services, rolling back, listing history
//! and inspecting live versions.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::adapters::{ArtifactStore, FsArtifactStore, ProcessBuildService, ProcessRuntime};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    BatchCoordinator, BatchOptions, BuildCoordinator, DeployError, DeployFailure, DeployOutcome,
    DeployStatus, Fingerprinter, JsonlHistoryStore, Orchestrator, RuntimeController,
    ServiceCatalog,
};
use crate::domain::VersionId;

/// shipyard - deployment orchestrator for independently deployable services
#[derive(Parser, Debug)]
#[command(name = "shipyard")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Deploy one service
    Deploy {
        /// Service name (a directory under the services directory)
        service: String,

        /// Target environment (defaults to the configured default)
        #[arg(short, long, env = "SHIPYARD_ENV")]
        env: Option<String>,

        /// Build and roll out even if the version is already live
        #[arg(short, long)]
        force: bool,
    },

    /// Deploy several services (all services if none are named)
    DeployAll {
        /// Service names
        services: Vec<String>,

        /// Target environment
        #[arg(short, long, env = "SHIPYARD_ENV")]
        env: Option<String>,

        /// Deploy one service at a time, in order
        #[arg(long)]
        sequential: bool,

        /// Maximum concurrent deployments
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Build and roll out even if versions are already live
        #[arg(short, long)]
        force: bool,
    },

    /// Roll back to a previously deployed version
    Rollback {
        /// Service name
        service: String,

        /// Version to restore
        version: String,

        /// Target environment
        #[arg(short, long, env = "SHIPYARD_ENV")]
        env: Option<String>,
    },

    /// List deployment history
    List {
        /// Only show this service
        service: Option<String>,
    },

    /// Show the live version of every service per environment
    Status,

    /// List compute targets known to the runtime
    Services {
        /// Only show this environment
        #[arg(short, long)]
        env: Option<String>,
    },

    /// List built artifacts
    Images {
        /// Only show this service
        service: Option<String>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Deploy {
                service,
                env,
                force,
            } => deploy(&service, env, force).await,
            Commands::DeployAll {
                services,
                env,
                sequential,
                concurrency,
                force,
            } => deploy_all(services, env, sequential, concurrency, force).await,
            Commands::Rollback {
                service,
                version,
                env,
            } => rollback(&service, &version, env).await,
            Commands::List { service } => list(service.as_deref()).await,
            Commands::Status => status().await,
            Commands::Services { env } => services(env.as_deref()).await,
            Commands::Images { service } => images(service.as_deref()).await,
            Commands::Config => show_config(),
        }
    }
}

/// Wire the orchestrator from configuration.
///
/// Commands that build or roll out need both adapter commands configured.
fn orchestrator(cfg: &ResolvedConfig, require_adapters: bool) -> Result<Orchestrator> {
    let build_command = adapter_command(&cfg.adapters.build_command, "build_command", require_adapters)?;
    let deploy_command =
        adapter_command(&cfg.adapters.deploy_command, "deploy_command", require_adapters)?;

    let builder = BuildCoordinator::new(
        Arc::new(ProcessBuildService::new(build_command)),
        Arc::new(FsArtifactStore::new(cfg.artifacts_dir())),
        cfg.build.into(),
    );
    let runtime = RuntimeController::new(
        Arc::new(ProcessRuntime::new(deploy_command, cfg.runtime_dir())),
        cfg.rollout.into(),
    );

    Ok(Orchestrator::new(
        Arc::new(JsonlHistoryStore::open(cfg.history_dir())),
        builder,
        runtime,
        Fingerprinter::new(&cfg.exclude),
    )
    .with_deployed_by(cfg.user.clone()))
}

fn adapter_command(command: &Option<String>, key: &str, required: bool) -> Result<String> {
    match command {
        Some(command) => Ok(command.clone()),
        None if required => anyhow::bail!(
            "No {} configured. Set adapters.{} in .shipyard/config.yaml",
            key,
            key
        ),
        None => Ok(String::new()),
    }
}

fn environment(cfg: &ResolvedConfig, env: Option<String>) -> String {
    env.unwrap_or_else(|| cfg.default_environment.clone())
}

/// Deploy one service
async fn deploy(service: &str, env: Option<String>, force: bool) -> Result<()> {
    let cfg = config::config()?;
    let environment = environment(cfg, env);
    let orchestrator = orchestrator(cfg, true)?;

    let descriptor = ServiceCatalog::new(&cfg.services)
        .load(service)
        .await
        .with_context(|| format!("Failed to load service '{}'", service))?;

    eprintln!("Deploying {} to {}...", service, environment);

    match orchestrator.deploy(&descriptor, &environment, force).await {
        Ok(outcome) => {
            print_outcome(&outcome);
            Ok(())
        }
        Err(failure) => {
            print_failure(service, &failure);
            std::process::exit(1);
        }
    }
}

/// Deploy many services
async fn deploy_all(
    services: Vec<String>,
    env: Option<String>,
    sequential: bool,
    concurrency: Option<usize>,
    force: bool,
) -> Result<()> {
    let cfg = config::config()?;
    let environment = environment(cfg, env);
    let catalog = Arc::new(ServiceCatalog::new(&cfg.services));

    let services = if services.is_empty() {
        catalog.names().await.context("Failed to list services")?
    } else {
        services
    };

    if services.is_empty() {
        println!("No services found in {}", cfg.services.display());
        return Ok(());
    }

    let options = if sequential {
        BatchOptions::sequential()
    } else {
        BatchOptions {
            parallel: cfg.batch.parallel,
            concurrency: concurrency.unwrap_or(cfg.batch.concurrency),
        }
    };

    eprintln!("Deploying {} services to {}...", services.len(), environment);

    let batch = BatchCoordinator::new(Arc::new(orchestrator(cfg, true)?), catalog);
    let report = batch.deploy_all(&services, &environment, options, force).await;

    for entry in &report.entries {
        match &entry.result {
            Ok(outcome) => print_outcome(outcome),
            Err(failure) => print_failure(&entry.service, failure),
        }
    }

    let failed = report.failed().count();
    eprintln!(
        "\n[{} succeeded, {} failed]",
        report.entries.len() - failed,
        failed
    );

    if !report.is_success() {
        std::process::exit(1);
    }

    Ok(())
}

/// Roll back a service
async fn rollback(service: &str, version: &str, env: Option<String>) -> Result<()> {
    let cfg = config::config()?;
    let environment = environment(cfg, env);
    let orchestrator = orchestrator(cfg, true)?;

    let descriptor = ServiceCatalog::new(&cfg.services)
        .load(service)
        .await
        .with_context(|| format!("Failed to load service '{}'", service))?;

    eprintln!("Rolling back {} in {} to {}...", service, environment, version);

    match orchestrator
        .rollback(&descriptor, &environment, &VersionId::from(version))
        .await
    {
        Ok(outcome) => {
            print_outcome(&outcome);
            Ok(())
        }
        Err(failure) => {
            print_failure(service, &failure);
            if let DeployError::VersionNotFound { available, .. } = &failure.error {
                if available.is_empty() {
                    eprintln!("   No versions available for rollback");
                } else {
                    eprintln!("   Available versions:");
                    for v in available {
                        eprintln!("     {}", v);
                    }
                }
            }
            std::process::exit(1);
        }
    }
}

/// List deployment history
async fn list(service: Option<&str>) -> Result<()> {
    let cfg = config::config()?;
    let records = orchestrator(cfg, false)?.list(service).await?;

    if records.is_empty() {
        println!("No deployments found");
        return Ok(());
    }

    println!(
        "{:<20} {:<16} {:<12} {:<17} {:<12} {:<9} {:<30} {:<10}",
        "TIME", "SERVICE", "ENV", "VERSION", "OUTCOME", "ACTION", "ENDPOINT", "BY"
    );
    println!("{}", "-".repeat(132));

    for record in records {
        println!(
            "{:<20} {:<16} {:<12} {:<17} {:<12} {:<9} {:<30} {:<10}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.service,
            record.environment,
            record.version,
            record.outcome.as_str(),
            record.action.as_str(),
            record.endpoint.as_ref().map(|e| e.as_str()).unwrap_or("-"),
            record.deployed_by.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}

/// Show live versions
async fn status() -> Result<()> {
    let cfg = config::config()?;
    let known = ServiceCatalog::new(&cfg.services)
        .names()
        .await
        .context("Failed to list services")?;

    let statuses = orchestrator(cfg, false)?
        .status(&known, &cfg.environments)
        .await?;

    if statuses.is_empty() {
        println!("No services found");
        return Ok(());
    }

    println!(
        "{:<20} {:<12} {:<17} {:<12} {:<20}",
        "SERVICE", "ENV", "VERSION", "OUTCOME", "SINCE"
    );
    println!("{}", "-".repeat(84));

    for status in statuses {
        match status.current {
            Some(record) => println!(
                "{:<20} {:<12} {:<17} {:<12} {:<20}",
                status.service,
                status.environment,
                record.version,
                record.outcome.as_str(),
                record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            ),
            None => println!(
                "{:<20} {:<12} {:<17} {:<12} {:<20}",
                status.service, status.environment, "-", "-", "-"
            ),
        }
    }

    Ok(())
}

/// List compute targets
async fn services(env: Option<&str>) -> Result<()> {
    let cfg = config::config()?;
    let orchestrator = orchestrator(cfg, false)?;
    let targets = orchestrator
        .runtime()
        .runtime()
        .list(env)
        .await
        .context("Failed to list compute targets")?;

    if targets.is_empty() {
        println!("No deployed services");
        return Ok(());
    }

    println!("{:<20} {:<12} {:<40} {:<30}", "SERVICE", "ENV", "ARTIFACT", "ENDPOINT");
    println!("{}", "-".repeat(105));

    for target in targets {
        println!(
            "{:<20} {:<12} {:<40} {:<30}",
            target.service, target.environment, target.artifact, target.endpoint
        );
    }

    Ok(())
}

/// List built artifacts
async fn images(service: Option<&str>) -> Result<()> {
    let cfg = config::config()?;
    let artifacts = FsArtifactStore::new(cfg.artifacts_dir())
        .list(service)
        .await
        .context("Failed to list artifacts")?;

    if artifacts.is_empty() {
        println!("No images found");
        return Ok(());
    }

    println!("{:<20} {:<17} {:<20} {:<40}", "SERVICE", "VERSION", "CREATED", "ARTIFACT");
    println!("{}", "-".repeat(100));

    for image in artifacts {
        println!(
            "{:<20} {:<17} {:<20} {:<40}",
            image.service,
            image.version,
            image
                .created_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            image.artifact,
        );
    }

    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Shipyard Configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (state):  {}", cfg.home.display());
    println!("  Services:      {}", cfg.services.display());
    println!("  History:       {}", cfg.history_dir().display());
    println!("  Artifacts:     {}", cfg.artifacts_dir().display());
    println!("  Runtime:       {}", cfg.runtime_dir().display());
    println!();
    println!("Environments: {} (default: {})", cfg.environments.join(", "), cfg.default_environment);
    println!(
        "Batch: {} (concurrency {})",
        if cfg.batch.parallel { "parallel" } else { "sequential" },
        cfg.batch.concurrency
    );
    println!(
        "Build timeout:   {}s, rollout timeout: {}s",
        cfg.build.timeout_seconds, cfg.rollout.timeout_seconds
    );
    println!();
    println!("Adapters:");
    println!(
        "  Build command:  {}",
        cfg.adapters.build_command.as_deref().unwrap_or("(not set)")
    );
    println!(
        "  Deploy command: {}",
        cfg.adapters.deploy_command.as_deref().unwrap_or("(not set)")
    );
    println!("Deployed by: {}", cfg.user.as_deref().unwrap_or("(unknown)"));

    Ok(())
}

fn print_outcome(outcome: &DeployOutcome) {
    match outcome.status {
        DeployStatus::Skipped => println!(
            "{} {}: skipped, {} already live",
            outcome.service, outcome.environment, outcome.version
        ),
        DeployStatus::Deployed | DeployStatus::RolledBack => println!(
            "{} {}: {} {} ({}) at {}",
            outcome.service,
            outcome.environment,
            outcome.status.as_str(),
            outcome.version,
            outcome.artifact,
            outcome
                .endpoint
                .as_ref()
                .map(|e| e.as_str())
                .unwrap_or("-"),
        ),
    }
}

fn print_failure(service: &str, failure: &DeployFailure) {
    eprintln!(
        "{}: failed at {} [{}]: {}",
        service,
        failure.stage,
        failure.kind(),
        failure.error
    );
    if failure.error.is_ambiguous() {
        eprintln!("   Remote state is uncertain; check the platform before retrying");
    }
}
