//! Run orchestration.
//!
//! A run refreshes the roster (falling back to the persisted one when the
//! source misbehaves), then takes every entity through plan, fetch, and merge.
//! One entity's failure is recorded in the summary and never stops the run.
//!
//! Only the orchestrator touches the [`Db`]. With `concurrency > 1`, fetches
//! run in a bounded pool and send their results back over a channel; planning
//! and merging stay on the orchestrator's task, so writes are serialized.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::config::SyncConfig;
use crate::db::{Db, DbError, PriceSeries};
use crate::error::{FetchError, SyncError};
use crate::fetcher::RemoteFetcher;
use crate::planner::{Plan, Window, WindowPlanner};
use crate::report::ReportingSink;
use crate::types::{Entity, PriceRow};

/// Position of an entity within the run, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {}", self.current, self.total)
    }
}

/// Why one entity did not complete.
#[derive(thiserror::Error, Debug)]
pub enum EntityFailure {
    #[error("watermark lookup failed: {0}")]
    Plan(#[source] DbError),
    #[error(transparent)]
    Fetch(FetchError),
    #[error("fetch timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("fetch task aborted: {0}")]
    Aborted(String),
    #[error("append failed: {0}")]
    Write(#[source] DbError),
}

impl EntityFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Plan(_) => "plan",
            Self::Fetch(_) => "fetch",
            Self::Timeout { .. } => "timeout",
            Self::Aborted(_) => "aborted",
            Self::Write(_) => "write",
        }
    }

    /// Whether the next run is likely to succeed without intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_transient(),
            Self::Timeout { .. } | Self::Aborted(_) => true,
            Self::Plan(_) | Self::Write(_) => false,
        }
    }
}

impl Serialize for EntityFailure {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("EntityFailure", 3)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("transient", &self.is_transient())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntityOutcome {
    /// Rows were fetched and appended. `rows` may be 0 (e.g. a delisted symbol).
    Done { rows: usize, dropped: usize },
    /// The watermark already covers today.
    Skipped { watermark: NaiveDate },
    Failed { error: EntityFailure },
}

impl EntityOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Done { .. } => "done",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EntityReport {
    pub progress: Progress,
    pub symbol: String,
    pub window: Option<Window>,
    pub outcome: EntityOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RosterOutcome {
    /// The stored roster was replaced by a fresh fetch.
    Refreshed {
        total: usize,
        added: usize,
        removed: usize,
        duplicates: usize,
    },
    /// The refresh failed; the run continues over the persisted roster.
    Fallback { total: usize, reason: String },
    /// The roster is maintained out of band (market indices) and was read as-is.
    Persisted { total: usize },
}

impl RosterOutcome {
    /// Number of entities the run will process.
    pub fn total(&self) -> usize {
        match self {
            Self::Refreshed { total, .. }
            | Self::Fallback { total, .. }
            | Self::Persisted { total } => *total,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub processed: usize,
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rows_added: usize,
}

impl RunCounts {
    fn tally(entities: &[EntityReport]) -> Self {
        let mut counts = Self {
            processed: entities.len(),
            ..Self::default()
        };
        for report in entities {
            match &report.outcome {
                EntityOutcome::Done { rows, .. } => {
                    counts.done += 1;
                    counts.rows_added += rows;
                }
                EntityOutcome::Skipped { .. } => counts.skipped += 1,
                EntityOutcome::Failed { .. } => counts.failed += 1,
            }
        }
        counts
    }
}

/// Everything that happened in one run, entities in roster order.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub series: PriceSeries,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub roster: RosterOutcome,
    pub counts: RunCounts,
    pub entities: Vec<EntityReport>,
}

impl RunSummary {
    pub fn failures(&self) -> impl Iterator<Item = &EntityReport> {
        self.entities
            .iter()
            .filter(|r| matches!(r.outcome, EntityOutcome::Failed { .. }))
    }
}

/// Drop repeated symbols (case-insensitive), keeping the first occurrence.
pub fn dedupe_roster(entities: Vec<Entity>) -> (Vec<Entity>, usize) {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(entities.len());
    let mut duplicates = 0;
    for mut entity in entities {
        entity.symbol = entity.symbol_key();
        if seen.insert(entity.symbol.clone()) {
            kept.push(entity);
        } else {
            tracing::warn!(symbol = %entity.symbol, "duplicate roster symbol ignored");
            duplicates += 1;
        }
    }
    (kept, duplicates)
}

/// Keep only rows dated inside `window`, one per date, ascending.
///
/// Sources occasionally return the bar preceding the requested start or
/// repeat a date; appending either would break the one-row-per-date rule.
pub fn trim_to_window(symbol: &str, window: &Window, rows: Vec<PriceRow>) -> (Vec<PriceRow>, usize) {
    let fetched = rows.len();
    let mut kept: Vec<PriceRow> = rows
        .into_iter()
        .filter(|row| window.contains(row.date))
        .map(|mut row| {
            row.symbol = symbol.to_string();
            row
        })
        .collect();
    kept.sort_by_key(|row| row.date);
    kept.dedup_by_key(|row| row.date);
    let dropped = fetched - kept.len();
    if dropped > 0 {
        tracing::debug!(symbol, dropped, "dropped rows outside window or repeated");
    }
    (kept, dropped)
}

async fn fetch_with_timeout<F: RemoteFetcher + ?Sized>(
    fetcher: &F,
    symbol: &str,
    window: &Window,
    limit: Duration,
) -> Result<Vec<PriceRow>, EntityFailure> {
    match tokio::time::timeout(limit, fetcher.fetch_prices(symbol, window)).await {
        Ok(Ok(rows)) => Ok(rows),
        Ok(Err(e)) => Err(EntityFailure::Fetch(e)),
        Err(_) => Err(EntityFailure::Timeout {
            secs: limit.as_secs(),
        }),
    }
}

struct FetchResult {
    progress: Progress,
    symbol: String,
    window: Window,
    result: Result<Vec<PriceRow>, EntityFailure>,
}

enum Planned {
    Ready(Window),
    Finished(EntityReport),
}

pub struct SyncOrchestrator<F: RemoteFetcher + 'static> {
    db: Db,
    fetcher: Arc<F>,
    planner: WindowPlanner,
    config: SyncConfig,
}

impl<F: RemoteFetcher + 'static> SyncOrchestrator<F> {
    pub fn new(db: Db, fetcher: F, planner: WindowPlanner, config: SyncConfig) -> Self {
        Self {
            db,
            fetcher: Arc::new(fetcher),
            planner,
            config,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn into_db(self) -> Db {
        self.db
    }

    /// Refresh the company roster, then sync every company.
    ///
    /// Returns an error only when the store itself is unusable.
    pub async fn run(&mut self, sink: &mut dyn ReportingSink) -> Result<RunSummary, SyncError> {
        let series = PriceSeries::Equity;
        let started_at = self.planner.now();
        sink.run_started(series);

        let (roster, outcome) = self.refresh_roster().await?;
        sink.roster_refreshed(&outcome);

        let entities = self.sync_all(series, &roster, sink).await;
        Ok(self.finish(series, started_at, outcome, entities, sink))
    }

    /// Sync every market index in the persisted index roster.
    pub async fn run_indices(
        &mut self,
        sink: &mut dyn ReportingSink,
    ) -> Result<RunSummary, SyncError> {
        let series = PriceSeries::Index;
        let started_at = self.planner.now();
        sink.run_started(series);

        let roster: Vec<Entity> = self.db.indices()?.iter().map(|r| r.entity()).collect();
        let outcome = RosterOutcome::Persisted {
            total: roster.len(),
        };
        sink.roster_refreshed(&outcome);

        let entities = self.sync_all(series, &roster, sink).await;
        Ok(self.finish(series, started_at, outcome, entities, sink))
    }

    async fn refresh_roster(&mut self) -> Result<(Vec<Entity>, RosterOutcome), SyncError> {
        let previous = self.db.entities()?;
        let persisted = previous.len();
        let fallback = move |reason: String| {
            tracing::warn!(
                reason = %reason,
                persisted,
                "roster refresh failed, continuing with persisted roster"
            );
            RosterOutcome::Fallback {
                total: persisted,
                reason,
            }
        };

        let limit = self.config.fetch_timeout();
        let fetched = match tokio::time::timeout(limit, self.fetcher.fetch_entity_roster()).await {
            Ok(Ok(fetched)) => fetched,
            Ok(Err(e)) => {
                let outcome = fallback(e.to_string());
                return Ok((previous, outcome));
            }
            Err(_) => {
                let outcome = fallback(format!("timed out after {}s", limit.as_secs()));
                return Ok((previous, outcome));
            }
        };

        let (roster, duplicates) = dedupe_roster(fetched);
        if roster.is_empty() {
            let outcome = fallback("source returned an empty roster".to_string());
            return Ok((previous, outcome));
        }
        if let Err(e) = self.db.replace_entities(&roster) {
            let outcome = fallback(format!("could not store roster: {}", e));
            return Ok((previous, outcome));
        }

        let before: HashSet<String> = previous.iter().map(|e| e.symbol_key()).collect();
        let after: HashSet<&str> = roster.iter().map(|e| e.symbol.as_str()).collect();
        let added = roster.iter().filter(|e| !before.contains(&e.symbol)).count();
        let removed = before.iter().filter(|s| !after.contains(s.as_str())).count();
        tracing::info!(total = roster.len(), added, removed, duplicates, "roster refreshed");

        let outcome = RosterOutcome::Refreshed {
            total: roster.len(),
            added,
            removed,
            duplicates,
        };
        Ok((roster, outcome))
    }

    async fn sync_all(
        &mut self,
        series: PriceSeries,
        roster: &[Entity],
        sink: &mut dyn ReportingSink,
    ) -> Vec<EntityReport> {
        let mut reports = if self.config.concurrency <= 1 {
            let total = roster.len();
            let mut reports = Vec::with_capacity(total);
            for (idx, entity) in roster.iter().enumerate() {
                let progress = Progress {
                    current: idx + 1,
                    total,
                };
                let report = self.sync_entity(series, entity, progress).await;
                sink.entity_finished(&report);
                reports.push(report);
            }
            reports
        } else {
            self.sync_pooled(series, roster, sink).await
        };
        reports.sort_by_key(|r| r.progress.current);
        reports
    }

    /// Plan, fetch, and merge a single entity.
    pub async fn sync_entity(
        &mut self,
        series: PriceSeries,
        entity: &Entity,
        progress: Progress,
    ) -> EntityReport {
        let symbol = entity.symbol_key();
        let window = match self.plan_entity(series, &symbol, progress) {
            Planned::Ready(window) => window,
            Planned::Finished(report) => return report,
        };
        let result = fetch_with_timeout(
            self.fetcher.as_ref(),
            &symbol,
            &window,
            self.config.fetch_timeout(),
        )
        .await;
        self.merge(
            series,
            FetchResult {
                progress,
                symbol,
                window,
                result,
            },
        )
    }

    fn plan_entity(&self, series: PriceSeries, symbol: &str, progress: Progress) -> Planned {
        let report = |window, outcome| EntityReport {
            progress,
            symbol: symbol.to_string(),
            window,
            outcome,
        };
        match self.planner.plan_window(&self.db, series, symbol) {
            Ok(Plan::Fetch(window)) => {
                tracing::debug!(symbol, %progress, %window, "planned");
                Planned::Ready(window)
            }
            Ok(Plan::NoWindowNeeded { watermark }) => {
                Planned::Finished(report(None, EntityOutcome::Skipped { watermark }))
            }
            Err(e) => Planned::Finished(report(
                None,
                EntityOutcome::Failed {
                    error: EntityFailure::Plan(e),
                },
            )),
        }
    }

    fn merge(&mut self, series: PriceSeries, fetched: FetchResult) -> EntityReport {
        let FetchResult {
            progress,
            symbol,
            window,
            result,
        } = fetched;
        let outcome = match result {
            Err(error) => EntityOutcome::Failed { error },
            Ok(rows) => {
                let (rows, dropped) = trim_to_window(&symbol, &window, rows);
                match self.db.append_series_prices(series, &rows) {
                    Ok(appended) => {
                        if series == PriceSeries::Index {
                            if let Some(last) = rows.last() {
                                if let Err(e) = self.db.set_index_last_date(&symbol, last.date) {
                                    tracing::warn!(symbol = %symbol, error = %e, "could not record index last date");
                                }
                            }
                        }
                        EntityOutcome::Done {
                            rows: appended,
                            dropped,
                        }
                    }
                    Err(e) => EntityOutcome::Failed {
                        error: EntityFailure::Write(e),
                    },
                }
            }
        };
        EntityReport {
            progress,
            symbol,
            window: Some(window),
            outcome,
        }
    }

    async fn sync_pooled(
        &mut self,
        series: PriceSeries,
        roster: &[Entity],
        sink: &mut dyn ReportingSink,
    ) -> Vec<EntityReport> {
        let total = roster.len();
        let limit = self.config.fetch_timeout();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let (tx, mut rx) = mpsc::unbounded_channel::<FetchResult>();
        let mut join_set = JoinSet::new();
        let mut in_flight: HashMap<usize, (String, Window)> = HashMap::new();
        let mut reports = Vec::with_capacity(total);

        for (idx, entity) in roster.iter().enumerate() {
            let progress = Progress {
                current: idx + 1,
                total,
            };

            // Keep the writer lane draining while the pool is busy.
            while let Ok(done) = rx.try_recv() {
                in_flight.remove(&done.progress.current);
                let report = self.merge(series, done);
                sink.entity_finished(&report);
                reports.push(report);
            }

            let symbol = entity.symbol_key();
            let window = match self.plan_entity(series, &symbol, progress) {
                Planned::Ready(window) => window,
                Planned::Finished(report) => {
                    sink.entity_finished(&report);
                    reports.push(report);
                    continue;
                }
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            in_flight.insert(progress.current, (symbol.clone(), window));
            let fetcher = Arc::clone(&self.fetcher);
            let sender = tx.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let result = fetch_with_timeout(fetcher.as_ref(), &symbol, &window, limit).await;
                let _ = sender.send(FetchResult {
                    progress,
                    symbol,
                    window,
                    result,
                });
            });
        }
        drop(tx);

        while let Some(done) = rx.recv().await {
            in_flight.remove(&done.progress.current);
            let report = self.merge(series, done);
            sink.entity_finished(&report);
            reports.push(report);
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                tracing::error!("fetch task failed: {}", e);
            }
        }

        // A worker that panicked never sent its result.
        for (current, (symbol, window)) in in_flight {
            let report = EntityReport {
                progress: Progress { current, total },
                symbol,
                window: Some(window),
                outcome: EntityOutcome::Failed {
                    error: EntityFailure::Aborted("worker exited without a result".into()),
                },
            };
            sink.entity_finished(&report);
            reports.push(report);
        }
        reports
    }

    fn finish(
        &self,
        series: PriceSeries,
        started_at: DateTime<Utc>,
        roster: RosterOutcome,
        entities: Vec<EntityReport>,
        sink: &mut dyn ReportingSink,
    ) -> RunSummary {
        let summary = RunSummary {
            series,
            started_at,
            finished_at: self.planner.now(),
            roster,
            counts: RunCounts::tally(&entities),
            entities,
        };
        self.record_run(&summary);
        sink.run_finished(&summary);
        summary
    }

    fn record_run(&self, summary: &RunSummary) {
        let record = LastRun {
            finished_at: summary.finished_at,
            roster: &summary.roster,
            counts: summary.counts,
        };
        let key = last_run_key(summary.series);
        let stored = serde_json::to_string(&record)
            .map_err(|e| e.to_string())
            .and_then(|json| self.db.set_meta(&key, &json).map_err(|e| e.to_string()));
        if let Err(e) = stored {
            tracing::warn!(key = %key, error = %e, "could not record run summary");
        }
    }
}

#[derive(Serialize)]
struct LastRun<'a> {
    finished_at: DateTime<Utc>,
    roster: &'a RosterOutcome,
    counts: RunCounts,
}

/// `ingest_meta` key holding the JSON summary of the last completed run.
pub fn last_run_key(series: PriceSeries) -> String {
    format!("last_run.{}", series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn row(day: u32) -> PriceRow {
        PriceRow {
            symbol: "bhp".into(),
            date: date(2020, 5, day),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            adj_close: 1.0,
            volume: 10,
        }
    }

    #[test]
    fn trim_drops_rows_outside_window_and_repeats() {
        let window = Window {
            start: date(2020, 5, 5),
            end: Utc.with_ymd_and_hms(2020, 5, 8, 12, 0, 0).unwrap(),
        };
        let rows = vec![row(4), row(6), row(5), row(6), row(8), row(9)];
        let (kept, dropped) = trim_to_window("BHP", &window, rows);
        let dates: Vec<NaiveDate> = kept.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![date(2020, 5, 5), date(2020, 5, 6), date(2020, 5, 8)]);
        assert_eq!(dropped, 3);
        assert!(kept.iter().all(|r| r.symbol == "BHP"));
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let roster = vec![
            Entity::new("BHP Group", "bhp", "Materials"),
            Entity::new("Commonwealth Bank", "CBA", "Banks"),
            Entity::new("BHP again", "BHP ", "Materials"),
        ];
        let (kept, duplicates) = dedupe_roster(roster);
        assert_eq!(duplicates, 1);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].name, "BHP Group");
        assert_eq!(kept[0].symbol, "BHP");
    }

    #[test]
    fn failure_serializes_kind_and_message() {
        let failure = EntityFailure::Timeout { secs: 5 };
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["transient"], true);
        assert_eq!(json["message"], "fetch timed out after 5s");
    }

    #[test]
    fn progress_displays_position() {
        let progress = Progress {
            current: 2,
            total: 3,
        };
        assert_eq!(progress.to_string(), "2 of 3");
    }
}
