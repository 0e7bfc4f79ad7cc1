//! accrual CLI - offline scenario runner for the reward accrual ledger.

use accrual_core::config::LoggingConfig;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::simulate::OutputFormat;

/// Pro-rata reward accrual: replay stake and reward scenarios against the
/// single-stream tracker or the multi-pool engine.
#[derive(Parser)]
#[command(name = "accrual")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path (JSON)
    #[arg(short, long, global = true, env = "ACCRUAL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Output directory for config
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Replay a scenario file and print balances, claimables and events
    Simulate {
        /// Scenario file (JSON)
        #[arg(short, long)]
        scenario: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Human)]
        format: OutputFormat,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;
    init_tracing(&config.logging, cli.verbose);

    match cli.command {
        Commands::Init { output, force } => commands::init::run(output, force),
        Commands::Simulate { scenario, format } => {
            commands::simulate::run(scenario, format, &config)
        }
    }
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json_output {
        builder.json().init();
    } else {
        builder.init();
    }
}
