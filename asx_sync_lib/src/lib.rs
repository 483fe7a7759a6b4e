//! Incremental end-of-day price sync for ASX-listed companies and market indices.
//!
//! The HTTP layer lives in [`asx_api`]; this crate adds the SQLite store,
//! window planning, retrying fetches, and the run orchestrator.

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod planner;
pub mod report;
pub mod sync;

pub use asx_api;
pub use asx_api::types;

pub use client::RetryingClient;
pub use config::{ConfigError, RetryConfig, SyncConfig};
pub use db::{Db, DbError, IndexRecord, PriceSeries, SymbolSummary};
pub use error::{FetchError, FetchErrorKind, SyncError};
pub use fetcher::RemoteFetcher;
pub use planner::{Clock, FixedClock, Plan, SystemClock, Window, WindowPlanner};
pub use report::{ReportingSink, TracingSink};
pub use sync::{
    EntityFailure, EntityOutcome, EntityReport, Progress, RosterOutcome, RunCounts, RunSummary,
    SyncOrchestrator,
};
