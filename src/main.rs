// src/main.rs

use anyhow::Result;
use clap::{Parser, Subcommand};
use converge::config::SystemConfig;
use converge::engine::{EngineConfig, ExecutionEngine, ExecutionStatus};
use std::path::PathBuf;
use tracing::info;

/// Exit code when changes require a reboot to take full effect
const EXIT_REBOOT_REQUIRED: i32 = 2;

#[derive(Parser)]
#[command(name = "converge")]
#[command(author, version, about = "Declarative OS configuration with live updates and rollback", long_about = None)]
struct Cli {
    /// State root holding the deployment store, snapshots and lock
    #[arg(long, global = true, default_value = "/var/lib/converge")]
    root: PathBuf,

    /// Log intended actions without changing the system
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the system against a configuration file
    Apply {
        /// Path to the target configuration (JSON)
        config: PathBuf,
        /// Refuse the whole update if any change needs a reboot
        #[arg(long)]
        no_partial: bool,
    },
    /// Show the changes an apply would make, without applying
    Plan {
        /// Path to the target configuration (JSON)
        config: PathBuf,
    },
    /// Check a configuration file for structural problems
    Validate {
        /// Path to the configuration (JSON)
        config: PathBuf,
    },
    /// Show deployment and sync status
    Status,
    /// List the deployment commit history
    History,
    /// Stage an earlier commit for the next boot
    Rollback {
        /// Commit id (as shown by `history`)
        commit: String,
    },
    /// Manage state snapshots
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Capture a snapshot of the current system state
    Create,
    /// List available snapshots, newest first
    List,
    /// Restore a snapshot's configuration record
    Restore {
        /// Snapshot id (as shown by `list`)
        id: String,
    },
}

fn engine(cli: &Cli, allow_partial_update: bool) -> Result<ExecutionEngine> {
    let config = EngineConfig {
        root: cli.root.clone(),
        dry_run: cli.dry_run,
        allow_partial_update,
    };
    Ok(ExecutionEngine::new(config)?)
}

fn short(id: &str) -> &str {
    &id[..12.min(id.len())]
}

fn run(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Commands::Apply { config, no_partial } => {
            let target = SystemConfig::load(config)?;
            let engine = engine(cli, !no_partial)?;
            info!("Applying configuration from {}", config.display());

            let result = engine.apply_configuration(&target)?;
            for change in &result.applied {
                println!("applied: {}", change.description);
            }
            for change in &result.pending_reboot {
                println!("pending reboot: {}", change.description);
            }
            match result.status {
                ExecutionStatus::Completed => {
                    println!(
                        "System converged ({} change(s) applied)",
                        result.applied.len()
                    );
                    Ok(0)
                }
                ExecutionStatus::RebootPending => {
                    println!(
                        "{} change(s) applied, {} pending reboot",
                        result.applied.len(),
                        result.pending_reboot.len()
                    );
                    Ok(EXIT_REBOOT_REQUIRED)
                }
                ExecutionStatus::Refused => {
                    println!("Update refused: reboot-required changes present (re-run without --no-partial to defer them)");
                    Ok(EXIT_REBOOT_REQUIRED)
                }
                ExecutionStatus::Failed { description, error } => {
                    eprintln!("Update failed at '{}': {}", description, error);
                    eprintln!(
                        "{} change(s) were applied before the failure and remain in effect",
                        result.applied.len()
                    );
                    Ok(1)
                }
            }
        }
        Commands::Plan { config } => {
            let target = SystemConfig::load(config)?;
            let engine = engine(cli, true)?;

            let changes = engine.plan(&target)?;
            if changes.is_empty() {
                println!("No changes; system already converged");
                return Ok(0);
            }
            for change in &changes {
                println!(
                    "[{} / {}] {}",
                    change.strategy, change.impact, change.description
                );
            }
            let capability = engine.can_reconcile(&target)?;
            println!(
                "{} live change(s), {} reboot-required, estimated {}s",
                capability.live_count,
                capability.reboot_count,
                capability.estimated_duration.as_secs()
            );
            if capability.reboot_count > 0 {
                return Ok(EXIT_REBOOT_REQUIRED);
            }
            Ok(0)
        }
        Commands::Validate { config } => {
            let target = SystemConfig::load(config)?;
            let engine = engine(cli, true)?;
            engine.validate_configuration(&target)?;
            println!("{} is valid", config.display());
            Ok(0)
        }
        Commands::Status => {
            let engine = engine(cli, true)?;
            let status = engine.status()?;
            match status.current_commit {
                Some(id) => println!("current commit:   {}", short(&id)),
                None => println!("current commit:   (none recorded)"),
            }
            match status.pending_commit {
                Some(id) => println!("next-boot commit: {}", short(&id)),
                None => println!("next-boot commit: (none)"),
            }
            println!("sync status:      {}", status.sync);
            println!("snapshots:        {}", status.snapshot_count);
            Ok(0)
        }
        Commands::History => {
            let engine = engine(cli, true)?;
            let commits = engine.history()?;
            if commits.is_empty() {
                println!("No commits yet");
                return Ok(0);
            }
            for commit in commits {
                println!(
                    "{}  {}  {}",
                    short(&commit.id),
                    commit.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    commit.subject
                );
            }
            Ok(0)
        }
        Commands::Rollback { commit } => {
            let engine = engine(cli, true)?;
            let info = engine.rollback_to(commit)?;
            println!(
                "Commit {} ({}) staged for next boot",
                short(&info.id),
                info.subject
            );
            Ok(0)
        }
        Commands::Snapshot { command } => match command {
            SnapshotCommands::Create => {
                let engine = engine(cli, true)?;
                let snapshot = engine.create_snapshot()?;
                println!("Snapshot {} created", snapshot.id);
                Ok(0)
            }
            SnapshotCommands::List => {
                let engine = engine(cli, true)?;
                let snapshots = engine.list_snapshots()?;
                if snapshots.is_empty() {
                    println!("No snapshots");
                    return Ok(0);
                }
                for snapshot in snapshots {
                    println!(
                        "{}  {}",
                        snapshot.id,
                        snapshot.timestamp.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                Ok(0)
            }
            SnapshotCommands::Restore { id } => {
                let engine = engine(cli, true)?;
                let config = engine.restore_snapshot(id)?;
                println!(
                    "Snapshot {} restored; recorded hostname: {}",
                    id, config.hostname
                );
                println!("Run `converge apply` against the restored configuration to reconcile");
                Ok(0)
            }
        },
    }
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let code = run(&cli)?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
