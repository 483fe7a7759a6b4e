use std::io::Write;

use anyhow::{bail, Result};
use asx_sync_lib::{
    EntityOutcome, EntityReport, IndexRecord, PriceSeries, RosterOutcome, SymbolSummary,
};
use serde::Serialize;
use tabled::{Table, Tabled};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => bail!("unknown output format '{}' (expected table, json, or csv)", other),
        }
    }
}

#[derive(Tabled, Serialize)]
struct StatusRow {
    #[tabled(rename = "Symbol")]
    #[serde(rename = "Symbol")]
    symbol: String,
    #[tabled(rename = "Name")]
    #[serde(rename = "Name")]
    name: String,
    #[tabled(rename = "Rows")]
    #[serde(rename = "Rows")]
    rows: i64,
    #[tabled(rename = "First")]
    #[serde(rename = "First")]
    first: String,
    #[tabled(rename = "Last")]
    #[serde(rename = "Last")]
    last: String,
}

#[derive(Tabled, Serialize)]
pub struct IndexRow {
    #[tabled(rename = "Symbol")]
    #[serde(rename = "Symbol")]
    symbol: String,
    #[tabled(rename = "Name")]
    #[serde(rename = "Name")]
    name: String,
    #[tabled(rename = "Last Date")]
    #[serde(rename = "Last Date")]
    last_date: String,
}

#[derive(Tabled, Serialize)]
struct ReportRow {
    #[tabled(rename = "#")]
    #[serde(rename = "#")]
    position: String,
    #[tabled(rename = "Series")]
    #[serde(rename = "Series")]
    series: String,
    #[tabled(rename = "Symbol")]
    #[serde(rename = "Symbol")]
    symbol: String,
    #[tabled(rename = "Status")]
    #[serde(rename = "Status")]
    status: String,
    #[tabled(rename = "Window")]
    #[serde(rename = "Window")]
    window: String,
    #[tabled(rename = "Rows")]
    #[serde(rename = "Rows")]
    rows: usize,
    #[tabled(rename = "Detail")]
    #[serde(rename = "Detail")]
    detail: String,
}

fn opt_date(date: Option<chrono::NaiveDate>) -> String {
    date.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string())
}

fn build_status_rows(summaries: &[SymbolSummary]) -> Vec<StatusRow> {
    summaries
        .iter()
        .map(|s| StatusRow {
            symbol: s.symbol.clone(),
            name: s.name.clone(),
            rows: s.rows,
            first: opt_date(s.first_date),
            last: opt_date(s.last_date),
        })
        .collect()
}

pub fn index_rows(indices: &[IndexRecord]) -> Vec<IndexRow> {
    indices
        .iter()
        .map(|i| IndexRow {
            symbol: i.symbol.clone(),
            name: i.name.clone(),
            last_date: opt_date(i.last_date),
        })
        .collect()
}

fn build_report_rows(reports: &[(PriceSeries, &EntityReport)]) -> Vec<ReportRow> {
    reports
        .iter()
        .map(|(series, r)| {
            let (rows, detail) = match &r.outcome {
                EntityOutcome::Done { rows, dropped } if *dropped > 0 => {
                    (*rows, format!("{} out-of-window rows dropped", dropped))
                }
                EntityOutcome::Done { rows, .. } => (*rows, String::new()),
                EntityOutcome::Skipped { watermark } => (0, format!("up to date at {}", watermark)),
                EntityOutcome::Failed { error } => (0, format!("{}: {}", error.kind(), error)),
            };
            ReportRow {
                position: r.progress.to_string(),
                series: series.to_string(),
                symbol: r.symbol.clone(),
                status: r.outcome.label().to_string(),
                window: r.window.map(|w| w.to_string()).unwrap_or_default(),
                rows,
                detail,
            }
        })
        .collect()
}

/// Human-readable roster outcome for the run summary.
pub fn describe_roster(outcome: &RosterOutcome) -> String {
    match outcome {
        RosterOutcome::Refreshed {
            total,
            added,
            removed,
            duplicates,
        } => {
            let mut text = format!("refreshed, {} entities ({} added, {} removed)", total, added, removed);
            if *duplicates > 0 {
                text.push_str(&format!(", {} duplicate symbols ignored", duplicates));
            }
            text
        }
        RosterOutcome::Fallback { total, reason } => {
            format!("refresh failed ({}), used {} persisted entities", reason, total)
        }
        RosterOutcome::Persisted { total } => format!("{} persisted entities", total),
    }
}

fn write_csv<T: Serialize, W: Write>(rows: Vec<T>, writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

// -- Table output --

pub fn print_status_table(summaries: &[SymbolSummary]) {
    println!("{}", Table::new(build_status_rows(summaries)));
}

pub fn print_indices_table(indices: &[IndexRecord]) {
    println!("{}", Table::new(index_rows(indices)));
}

pub fn print_reports_table(reports: &[(PriceSeries, &EntityReport)]) {
    println!("{}", Table::new(build_report_rows(reports)));
}

// -- CSV output --

pub fn print_status_csv(summaries: &[SymbolSummary]) -> Result<()> {
    write_csv(build_status_rows(summaries), std::io::stdout())
}

pub fn print_indices_csv(indices: &[IndexRecord]) -> Result<()> {
    write_csv(index_rows(indices), std::io::stdout())
}

pub fn print_reports_csv(reports: &[(PriceSeries, &EntityReport)]) -> Result<()> {
    write_csv(build_report_rows(reports), std::io::stdout())
}

// -- JSON output --

pub fn print_json<T: serde::Serialize>(data: &T) {
    match serde_json::to_string_pretty(data) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize to JSON: {}", e),
    }
}
