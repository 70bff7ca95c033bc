//! modsplice - byte-level mod installer

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use modsplice::installer::{
    self, FileModification, InstallOutcome, InstallSession, InstallationStatus, InstallerConfig,
    Precedence, ProgressCallback, ProgressEvent, Severity, TracingSink, ValidationResponse,
};
use modsplice::manifest;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "modsplice")]
#[command(version)]
#[command(about = "Install mods as byte-level writes with collision detection and rollback")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Install mods, in the order given
    Install {
        /// Mod directories or mod.json files
        #[arg(required = true)]
        mods: Vec<PathBuf>,

        #[command(flatten)]
        session: SessionArgs,

        /// Write a JSON report of the outcome to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Plan and check mods for collisions without writing anything
    Plan {
        /// Mod directories or mod.json files
        #[arg(required = true)]
        mods: Vec<PathBuf>,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Restore the files of a session from its backup directory
    Restore {
        /// Backup session directory (contains manifest.json)
        session_dir: PathBuf,
    },
}

#[derive(Args)]
struct SessionArgs {
    /// JSON configuration file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory of the application being modded
    #[arg(short, long, env = "MODSPLICE_TARGET")]
    target: Option<PathBuf>,

    /// Working directory for extracted archives
    #[arg(long)]
    temp: Option<PathBuf>,

    /// Directory for per-session backups
    #[arg(long)]
    backup: Option<PathBuf>,

    /// Path to the QuickBMS binary
    #[arg(long, env = "QUICKBMS_PATH")]
    tool: Option<PathBuf>,

    /// Maximum concurrent extraction batches (defaults to CPU thread count)
    #[arg(long)]
    max_batches: Option<usize>,

    /// Resolve overlapping writes silently instead of warning
    #[arg(long)]
    no_collision_check: bool,

    /// Which mod wins an overlap
    #[arg(long, value_enum)]
    precedence: Option<PrecedenceArg>,

    /// Destination with zero-tolerance collision policy (repeatable)
    #[arg(long = "reserved")]
    reserved: Vec<String>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum PrecedenceArg {
    Last,
    First,
}

impl SessionArgs {
    fn into_config(self) -> Result<InstallerConfig> {
        let mut config = match &self.config {
            Some(path) => InstallerConfig::load(path)?,
            None => InstallerConfig::default(),
        };

        if let Some(target) = self.target {
            config.target_path = target;
        }
        if config.target_path.as_os_str().is_empty() {
            bail!("No target directory given (--target or MODSPLICE_TARGET)");
        }
        if let Some(temp) = self.temp {
            config.temp_folder = temp;
        }
        if let Some(backup) = self.backup {
            config.backup_folder = backup;
        }
        if self.tool.is_some() {
            config.tool_path = self.tool;
        }
        if let Some(n) = self.max_batches {
            config.max_quickbms_batches = n;
        }
        if self.no_collision_check {
            config.check_for_collisions = false;
        }
        if let Some(p) = self.precedence {
            config.precedence = match p {
                PrecedenceArg::Last => Precedence::LastInstalledWins,
                PrecedenceArg::First => Precedence::FirstInstalledWins,
            };
        }
        config.reserved_files.extend(self.reserved);

        Ok(config)
    }
}

/// JSON report written by `install --report`
#[derive(Serialize)]
struct Report<'a> {
    session_id: String,
    status: InstallationStatus,
    state: &'a str,
    responses: &'a [ValidationResponse],
    modifications: &'a [FileModification],
}

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn progress_callback(pb: &ProgressBar) -> ProgressCallback {
    let pb = pb.clone();
    Arc::new(move |event| match event {
        ProgressEvent::PhaseStarted { phase } => pb.set_message(phase.to_string()),
        ProgressEvent::BatchFinished { archive, current, total } => {
            pb.set_message(format!("Extracted {}/{}: {}", current, total, archive.display()))
        }
        ProgressEvent::FileApplied { destination, current, total } => {
            pb.set_message(format!("Applied {}/{}: {}", current, total, destination))
        }
        ProgressEvent::FileRestored { destination } => {
            pb.set_message(format!("Restored {}", destination.display()))
        }
    })
}

fn print_responses(responses: &[ValidationResponse], verbose: bool) {
    for response in responses {
        if verbose || response.severity != Severity::None {
            println!("{}", response);
        }
    }
}

fn write_report(path: &Path, outcome: &InstallOutcome) -> Result<()> {
    let report = Report {
        session_id: outcome.session_id.to_string(),
        status: outcome.status,
        state: outcome.final_state.name(),
        responses: &outcome.responses,
        modifications: &outcome.modifications,
    };
    let json = serde_json::to_string_pretty(&report)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write report {}", path.display()))?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only initialize logging if verbose or RUST_LOG is set
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive(if cli.verbose { "modsplice=debug".parse()? } else { "modsplice=warn".parse()? }),
            )
            .init();
    }

    let exit_code = match cli.command {
        Commands::Install { mods, session, report } => {
            let config = session.into_config()?;
            println!("Target:     {}", config.target_path.display());
            println!("Mods:       {}", mods.len());
            println!("Precedence: {}", config.precedence);
            println!();

            let outcome = match manifest::load_mods(&mods) {
                Ok(packages) => {
                    let pb = spinner();
                    let outcome = InstallSession::new(config, Arc::new(TracingSink))?
                        .with_progress(progress_callback(&pb))
                        .install(&packages);
                    pb.finish_and_clear();
                    outcome
                }
                Err(e) => InstallOutcome::from_manifest_error(&e),
            };

            print_responses(&outcome.responses, cli.verbose);
            println!("\n=== Installation Summary ===");
            println!("Session: {}", outcome.session_id);
            println!("Status:  {} ({})", outcome.status, outcome.final_state);
            println!("Files:   {} modified", outcome.modifications.len());
            if let Some(rollback) = &outcome.rollback {
                println!(
                    "Rollback: {} restored, {} removed, {} failed",
                    rollback.restored,
                    rollback.removed,
                    rollback.failures.len()
                );
            }
            if outcome.status == InstallationStatus::RolledBackError {
                println!("\nThe target may be partially modified. Run `modsplice restore` on the kept backup directory.");
            }

            if let Some(path) = report {
                write_report(&path, &outcome)?;
            }
            outcome.status.exit_code()
        }

        Commands::Plan { mods, session } => {
            let config = session.into_config()?;
            match manifest::load_mods(&mods) {
                Ok(packages) => {
                    let mut session = InstallSession::new(config, Arc::new(TracingSink))?;
                    let dry = session.plan_only(&packages);
                    print_responses(&dry.responses, true);

                    println!("\n=== Plan ===");
                    for file in dry.plan.files.values() {
                        println!(
                            "{:>6} ops  {:>10} -> {:>10} bytes  {}",
                            file.ops.len(),
                            file.original_len.map(|l| l.to_string()).unwrap_or_else(|| "new".into()),
                            file.planned_len(),
                            file.destination
                        );
                    }
                    println!("\nStatus: {}", dry.status);
                    dry.status.exit_code()
                }
                Err(e) => {
                    eprintln!("{}", e);
                    InstallationStatus::InvalidActions.exit_code()
                }
            }
        }

        Commands::Restore { session_dir } => {
            let pb = spinner();
            let callback = progress_callback(&pb);
            let report = installer::restore_session(&session_dir, &TracingSink, Some(&callback))?;
            pb.finish_and_clear();

            println!("Restored {} files, removed {} new files", report.restored, report.removed);
            for failure in &report.failures {
                println!("  FAILED {}: {}", failure.destination, failure.error);
            }
            if report.is_clean() {
                0
            } else {
                InstallationStatus::RolledBackError.exit_code()
            }
        }
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
