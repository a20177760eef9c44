//! Skiff CLI - Command-line interface
//!
//! Drives a transfer registry against the simulated engine and inspects
//! torrent descriptors.

mod commands;

use anyhow::Context;
use clap::Parser;
use skiff_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "skiff")]
#[command(about = "Transfer registry for BitTorrent and HTTP downloads")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level
    #[arg(long, default_value = "info")]
    log_level: CliLogLevel,

    /// Directory for the full trace log of this run
    #[arg(long)]
    logs_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .context("Failed to initialize tracing")?;

    commands::handle_command(cli.command).await
}
