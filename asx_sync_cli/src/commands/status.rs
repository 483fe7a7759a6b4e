//! The `status` subcommand: what the store currently holds.

use std::path::PathBuf;

use anyhow::{bail, Result};
use asx_sync_lib::sync::last_run_key;
use asx_sync_lib::{Db, PriceSeries};
use clap::Args;

use crate::output::{self, OutputFormat};

/// Arguments for the `status` subcommand.
#[derive(Args)]
pub struct StatusArgs {
    /// SQLite database path
    #[arg(long, default_value = super::DEFAULT_DB_PATH)]
    pub db: PathBuf,

    /// Report on market indices instead of companies
    #[arg(long)]
    pub indices: bool,
}

pub fn run(args: &StatusArgs, format: &OutputFormat) -> Result<()> {
    if !args.db.exists() {
        bail!(
            "database {} does not exist; run `asxsync sync` first",
            args.db.display()
        );
    }
    let mut db = Db::open(&args.db)?;
    db.ensure_schema()?;

    let series = if args.indices {
        PriceSeries::Index
    } else {
        PriceSeries::Equity
    };

    match db.get_meta(&last_run_key(series))? {
        Some(raw) => eprintln!("Last {} run: {}", series, describe_last_run(&raw)),
        None => eprintln!("No completed {} run recorded", series),
    }

    let summaries = db.roster_summaries(series)?;
    match format {
        OutputFormat::Table => output::print_status_table(&summaries),
        OutputFormat::Json => output::print_json(&summaries),
        OutputFormat::Csv => output::print_status_csv(&summaries)?,
    }
    Ok(())
}

/// One-line rendering of the stored last-run record. Falls back to the raw
/// value if it is not the expected shape.
fn describe_last_run(raw: &str) -> String {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return raw.to_string(),
    };
    let counts = &value["counts"];
    match (
        value["finished_at"].as_str(),
        counts["done"].as_u64(),
        counts["skipped"].as_u64(),
        counts["failed"].as_u64(),
        counts["rows_added"].as_u64(),
    ) {
        (Some(at), Some(done), Some(skipped), Some(failed), Some(rows)) => format!(
            "finished {}: {} done, {} skipped, {} failed, {} rows added",
            at, done, skipped, failed, rows
        ),
        _ => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_recorded_run() {
        let raw = r#"{"finished_at":"2020-05-11T06:00:00Z","roster":{"status":"persisted","total":1},"counts":{"processed":3,"done":2,"skipped":0,"failed":1,"rows_added":6}}"#;
        assert_eq!(
            describe_last_run(raw),
            "finished 2020-05-11T06:00:00Z: 2 done, 0 skipped, 1 failed, 6 rows added"
        );
    }

    #[test]
    fn unexpected_record_is_shown_raw() {
        assert_eq!(describe_last_run("2020-05-11"), "2020-05-11");
        assert_eq!(describe_last_run(r#"{"counts":{}}"#), r#"{"counts":{}}"#);
    }
}
