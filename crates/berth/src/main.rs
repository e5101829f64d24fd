//! berth — operator CLI for the berth connection pool.
//!
//! # Usage
//!
//! ```text
//! berth check --config berth.toml
//! berth probe --config berth.toml --workers 8 --iterations 100
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::probe::ProbeOptions;
use config::BerthConfig;

const DEFAULT_LOG_FILTER: &str = "info,berth=debug,berth_pool=debug";

#[derive(Parser)]
#[command(
    name = "berth",
    about = "Berth — fixed-capacity connection pool tooling",
    version,
    propagate_version = true
)]
struct Cli {
    /// Emit logs and reports as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a configuration file and print the effective settings.
    Check {
        /// Path to berth.toml.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run concurrent acquire/send/recv/release cycles against the endpoint.
    Probe {
        /// Path to berth.toml.
        #[arg(short, long)]
        config: PathBuf,

        /// Number of concurrent workers.
        #[arg(short, long, default_value = "4")]
        workers: usize,

        /// Cycles per worker.
        #[arg(short, long, default_value = "10")]
        iterations: usize,

        /// Bytes sent on every cycle.
        #[arg(long, default_value = "ping")]
        payload: String,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Check { config } => commands::check::run(&config),
        Command::Probe {
            config,
            workers,
            iterations,
            payload,
        } => {
            let config = BerthConfig::from_file(&config)?;
            let options = ProbeOptions {
                workers,
                iterations,
                payload,
            };
            let report = commands::probe::run(&config, &options).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.format_text());
            }
            if report.failed() > 0 {
                anyhow::bail!("{} of {} probe cycles failed", report.failed(), workers * iterations);
            }
            Ok(())
        }
    }
}
