//! The `sync` subcommand: refresh the roster and append new daily prices.

use std::path::PathBuf;

use anyhow::{Context, Result};
use asx_sync_lib::{
    Db, RetryingClient, RunSummary, SyncConfig, SyncOrchestrator, WindowPlanner,
};
use chrono::NaiveDate;
use clap::Args;

use crate::output::{self, OutputFormat};
use crate::progress::ProgressSink;

/// Arguments for the `sync` subcommand.
#[derive(Args)]
pub struct SyncArgs {
    /// SQLite database path
    #[arg(long, default_value = super::DEFAULT_DB_PATH)]
    pub db: PathBuf,

    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of concurrent price fetches
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Give up on one symbol's fetch after this many seconds
    #[arg(long)]
    pub fetch_timeout_secs: Option<u64>,

    /// Minimum delay between requests in milliseconds
    #[arg(long)]
    pub delay_ms: Option<u64>,

    /// First date requested for symbols with no stored prices (YYYY-MM-DD)
    #[arg(long)]
    pub history_floor: Option<NaiveDate>,

    /// Roster CSV URL (defaults to ASXSYNC_ROSTER_URL, then the ASX listing)
    #[arg(long)]
    pub roster_url: Option<String>,

    /// Price download base URL (defaults to ASXSYNC_PRICE_BASE_URL)
    #[arg(long)]
    pub price_url: Option<String>,

    /// Also sync the market index roster (see `asxsync indices`)
    #[arg(long)]
    pub with_indices: bool,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

pub async fn run(args: &SyncArgs, format: &OutputFormat) -> Result<()> {
    let config = load_config(args)?;
    tracing::debug!(?config, "effective configuration");

    let mut db = Db::open(&args.db)
        .with_context(|| format!("failed to open database {}", args.db.display()))?;
    db.ensure_schema()?;

    let roster_url = args
        .roster_url
        .clone()
        .or_else(|| std::env::var("ASXSYNC_ROSTER_URL").ok());
    let price_url = args
        .price_url
        .clone()
        .or_else(|| std::env::var("ASXSYNC_PRICE_BASE_URL").ok());
    let client =
        RetryingClient::from_config(&config, roster_url.as_deref(), price_url.as_deref())?;

    eprintln!(
        "Starting sync into {} ({} concurrent, history from {})",
        args.db.display(),
        config.concurrency,
        config.history_floor
    );

    let planner = WindowPlanner::system(config.history_floor);
    let mut orchestrator = SyncOrchestrator::new(db, client, planner, config);
    let mut sink = ProgressSink::new(!args.no_progress);

    let mut summaries = vec![orchestrator.run(&mut sink).await?];
    if args.with_indices {
        summaries.push(orchestrator.run_indices(&mut sink).await?);
    }

    for summary in &summaries {
        print_run_summary(summary);
    }

    match format {
        OutputFormat::Table => {
            let failed: Vec<_> = summaries
                .iter()
                .flat_map(|s| s.failures().map(move |r| (s.series, r)))
                .collect();
            if !failed.is_empty() {
                output::print_reports_table(&failed);
            }
        }
        OutputFormat::Json => output::print_json(&summaries),
        OutputFormat::Csv => {
            let all: Vec<_> = summaries
                .iter()
                .flat_map(|s| s.entities.iter().map(move |r| (s.series, r)))
                .collect();
            output::print_reports_csv(&all)?;
        }
    }
    Ok(())
}

/// Config file (if any), then `ASXSYNC_*` environment, then flags.
fn load_config(args: &SyncArgs) -> Result<SyncConfig> {
    let base = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    let config = apply_flags(base.with_env_overrides()?, args);
    config.validate()?;
    Ok(config)
}

fn apply_flags(mut config: SyncConfig, args: &SyncArgs) -> SyncConfig {
    if let Some(n) = args.concurrency {
        config.concurrency = n;
    }
    if let Some(secs) = args.fetch_timeout_secs {
        config.fetch_timeout_secs = secs;
    }
    if let Some(ms) = args.delay_ms {
        config.request_delay_ms = ms;
    }
    if let Some(floor) = args.history_floor {
        config.history_floor = floor;
    }
    config
}

fn print_run_summary(summary: &RunSummary) {
    let counts = summary.counts;
    let elapsed = summary.finished_at - summary.started_at;
    eprintln!();
    eprintln!(
        "{} sync complete: {} done, {} skipped, {} failed ({} rows added, {}s)",
        summary.series,
        counts.done,
        counts.skipped,
        counts.failed,
        counts.rows_added,
        elapsed.num_seconds()
    );
    eprintln!("  roster: {}", output::describe_roster(&summary.roster));
    let transient = summary
        .failures()
        .filter(|r| match &r.outcome {
            asx_sync_lib::EntityOutcome::Failed { error } => error.is_transient(),
            _ => false,
        })
        .count();
    if transient > 0 {
        eprintln!(
            "  {} failure(s) look transient and will be retried on the next run",
            transient
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: SyncArgs,
    }

    fn parse(argv: &[&str]) -> SyncArgs {
        let mut full = vec!["asxsync"];
        full.extend_from_slice(argv);
        Harness::parse_from(full).args
    }

    #[test]
    fn defaults_leave_config_untouched() {
        let args = parse(&[]);
        assert_eq!(args.db, PathBuf::from("asx_db.sqlite"));
        assert!(!args.with_indices);
        assert_eq!(apply_flags(SyncConfig::default(), &args), SyncConfig::default());
    }

    #[test]
    fn flags_override_config() {
        let args = parse(&[
            "--concurrency",
            "4",
            "--fetch-timeout-secs",
            "9",
            "--delay-ms",
            "0",
            "--history-floor",
            "2001-02-03",
            "--with-indices",
        ]);
        let config = apply_flags(SyncConfig::default(), &args);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.fetch_timeout_secs, 9);
        assert_eq!(config.request_delay_ms, 0);
        assert_eq!(
            config.history_floor,
            NaiveDate::from_ymd_opt(2001, 2, 3).unwrap()
        );
        assert!(args.with_indices);
    }

    #[test]
    fn zero_concurrency_flag_fails_validation() {
        let args = parse(&["--concurrency", "0"]);
        assert!(apply_flags(SyncConfig::default(), &args).validate().is_err());
    }
}
