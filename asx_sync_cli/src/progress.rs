//! Progress bar reporting for interactive runs.

use asx_sync_lib::{
    EntityOutcome, EntityReport, PriceSeries, ReportingSink, RosterOutcome, RunSummary,
    TracingSink,
};
use indicatif::{ProgressBar, ProgressStyle};

/// Drives an `indicatif` bar from run events and forwards every event to
/// [`TracingSink`].
pub struct ProgressSink {
    enabled: bool,
    bar: Option<ProgressBar>,
    tracing: TracingSink,
    series: Option<PriceSeries>,
    done: usize,
    failed: usize,
    skipped: usize,
}

impl ProgressSink {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            bar: None,
            tracing: TracingSink,
            series: None,
            done: 0,
            failed: 0,
            skipped: 0,
        }
    }

    fn status(&self) -> String {
        format!(
            "{} ok, {} err, {} skip",
            self.done, self.failed, self.skipped
        )
    }
}

impl ReportingSink for ProgressSink {
    fn run_started(&mut self, series: PriceSeries) {
        self.series = Some(series);
        self.done = 0;
        self.failed = 0;
        self.skipped = 0;
        self.tracing.run_started(series);
    }

    fn roster_refreshed(&mut self, outcome: &RosterOutcome) {
        self.tracing.roster_refreshed(outcome);
        if !self.enabled {
            return;
        }
        let pb = ProgressBar::new(outcome.total() as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} ({eta}) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        let series = self.series.map(|s| s.as_str()).unwrap_or("prices");
        pb.set_message(format!("syncing {}...", series));
        self.bar = Some(pb);
    }

    fn entity_finished(&mut self, report: &EntityReport) {
        match report.outcome {
            EntityOutcome::Done { .. } => self.done += 1,
            EntityOutcome::Skipped { .. } => self.skipped += 1,
            EntityOutcome::Failed { .. } => self.failed += 1,
        }
        self.tracing.entity_finished(report);
        if let Some(pb) = &self.bar {
            pb.inc(1);
            pb.set_message(self.status());
        }
    }

    fn run_finished(&mut self, summary: &RunSummary) {
        if let Some(pb) = self.bar.take() {
            pb.finish_with_message(self.status());
        }
        self.tracing.run_finished(summary);
    }
}
