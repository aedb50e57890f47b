//! Engine Shift - operator CLI
//!
//! Inspect and steer a gradual migration from the legacy engine to the
//! candidate engine: status, health, statistics, emergency rollback,
//! recovery, breaker drills and a simulated load run.

#![forbid(unsafe_code)]

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use eshift_common::MigrationError;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "eshift")]
#[command(author, version, about = "Engine Shift - gradual engine migration control")]
struct Cli {
    /// Rollback state file (default: ESHIFT_STATE_FILE or the data directory)
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,

    /// TOML config file with a [migration] table
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show routing configuration, breaker and rollback state
    Status,
    /// Evaluate component health (exit code 1 when critical)
    Health,
    /// Show performance, adapter and breaker statistics
    Stats,
    /// Emergency rollback: force all traffic to the legacy engine
    Rollback {
        /// Why the rollback is needed (recorded in history)
        #[arg(long)]
        reason: String,
        /// Who requested it (opaque audit string)
        #[arg(long)]
        operator: Option<String>,
    },
    /// Attempt to recover from a rollback (checks this process's breaker only)
    ///
    /// Breaker state is not persisted. Each invocation starts with a fresh,
    /// closed breaker, so a successful recover here does not mean a
    /// long-running service's breaker was checked. Only the persisted
    /// rollback state is restored and cleared.
    Recover,
    /// Drill: force this process's breaker open and run the automatic rollback
    ///
    /// The opened breaker lasts only for this invocation. The rollback it
    /// triggers is persisted and stays in effect.
    TripBreaker,
    /// Clear the recovery failure counter and reset an open breaker
    ResetBreaker,
    /// Run simulated traffic through the demo engines
    Simulate {
        /// Number of requests to send
        #[arg(long, default_value_t = 100)]
        requests: usize,
        /// Probability (0.0-1.0) that the demo candidate fails
        #[arg(long)]
        candidate_failure_rate: Option<f64>,
        /// Override the candidate routing percentage for this run
        #[arg(long)]
        percentage: Option<u32>,
        /// Enable canary sampling at this rate for this run
        #[arg(long)]
        canary_rate: Option<u32>,
        /// Seed for routing and failure injection
        #[arg(long)]
        seed: Option<u64>,
        /// Persist rollback state produced by the run
        #[arg(long)]
        persist: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => Ok(code),
        Err(err) => {
            if let Some(migration) = err.downcast_ref::<MigrationError>() {
                eprintln!("{}", migration.code().entry().format_full());
            }
            Err(err)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let ctx = commands::Context::load(cli.config.clone(), cli.state_file.clone(), cli.json, cli.verbose)?;

    let ok = match cli.command {
        Command::Status => commands::status(&ctx)?,
        Command::Health => commands::health(&ctx)?,
        Command::Stats => commands::stats(&ctx)?,
        Command::Rollback { reason, operator } => {
            commands::rollback(&ctx, &reason, operator.as_deref())?
        }
        Command::Recover => commands::recover(&ctx)?,
        Command::TripBreaker => commands::trip_breaker(&ctx)?,
        Command::ResetBreaker => commands::reset_breaker(&ctx)?,
        Command::Simulate {
            requests,
            candidate_failure_rate,
            percentage,
            canary_rate,
            seed,
            persist,
        } => {
            let options = commands::SimulateOptions {
                requests,
                candidate_failure_rate,
                percentage,
                canary_rate,
                seed,
                persist,
            };
            commands::simulate(&ctx, options).await?
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
