//! Run event reporting.

use crate::db::PriceSeries;
use crate::sync::{EntityOutcome, EntityReport, RosterOutcome, RunSummary};

/// Receives run events as they happen. The CLI drives a progress bar from
/// these; [`TracingSink`] turns them into structured log lines.
pub trait ReportingSink: Send {
    fn run_started(&mut self, series: PriceSeries);
    fn roster_refreshed(&mut self, outcome: &RosterOutcome);
    fn entity_finished(&mut self, report: &EntityReport);
    fn run_finished(&mut self, summary: &RunSummary);
}

#[derive(Debug, Default)]
pub struct TracingSink;

impl ReportingSink for TracingSink {
    fn run_started(&mut self, series: PriceSeries) {
        tracing::info!(%series, "sync run started");
    }

    fn roster_refreshed(&mut self, outcome: &RosterOutcome) {
        match outcome {
            RosterOutcome::Refreshed {
                total,
                added,
                removed,
                duplicates,
            } => tracing::info!(total, added, removed, duplicates, "roster ready"),
            RosterOutcome::Fallback { total, reason } => {
                tracing::warn!(total, reason = %reason, "using persisted roster")
            }
            RosterOutcome::Persisted { total } => tracing::info!(total, "roster loaded"),
        }
    }

    fn entity_finished(&mut self, report: &EntityReport) {
        let progress = report.progress;
        let symbol = report.symbol.as_str();
        let window = report.window.map(|w| w.to_string()).unwrap_or_default();
        match &report.outcome {
            EntityOutcome::Done { rows, dropped } => {
                tracing::info!(%progress, symbol, window = %window, rows, dropped, "synced")
            }
            EntityOutcome::Skipped { watermark } => {
                tracing::debug!(%progress, symbol, %watermark, "up to date")
            }
            EntityOutcome::Failed { error } => tracing::warn!(
                %progress,
                symbol,
                window = %window,
                kind = error.kind(),
                transient = error.is_transient(),
                error = %error,
                "entity failed"
            ),
        }
    }

    fn run_finished(&mut self, summary: &RunSummary) {
        let counts = summary.counts;
        tracing::info!(
            series = %summary.series,
            processed = counts.processed,
            done = counts.done,
            skipped = counts.skipped,
            failed = counts.failed,
            rows_added = counts.rows_added,
            "sync run finished"
        );
    }
}
