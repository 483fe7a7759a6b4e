mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::output::OutputFormat;

const DEFAULT_LOG_FILTER: &str = "asxsync=info,asx_sync_lib=info,asx_api=warn";

#[derive(Parser)]
#[command(name = "asxsync")]
#[command(about = "Incrementally sync ASX end-of-day prices into SQLite")]
struct Cli {
    /// Output format: table, json, or csv
    #[arg(long, default_value = "table", global = true)]
    output: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Refresh the company roster and fetch new daily prices
    Sync(commands::sync::SyncArgs),
    /// Show per-symbol coverage and the last completed run
    Status(commands::status::StatusArgs),
    /// Manage the market index roster
    Indices(commands::indices::IndicesArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let format = OutputFormat::parse(&cli.output)?;

    match &cli.command {
        Commands::Sync(args) => commands::sync::run(args, &format).await?,
        Commands::Status(args) => commands::status::run(args, &format)?,
        Commands::Indices(args) => commands::indices::run(args, &format)?,
    }

    Ok(())
}
