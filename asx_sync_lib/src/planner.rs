//! Fetch window planning.
//!
//! A window runs from the day after the stored watermark up to "now". A symbol
//! with no stored rows starts at the configured history floor instead.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::db::{epoch_sentinel, Db, DbError, PriceSeries};

/// Source of the current instant, injectable so planning is deterministic in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Inclusive start date, exclusive end instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub start: NaiveDate,
    pub end: DateTime<Utc>,
}

impl Window {
    /// Last calendar day (UTC) the window can hold rows for.
    pub fn end_date(&self) -> NaiveDate {
        self.end.date_naive()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end_date()
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end_date())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Fetch(Window),
    /// The watermark already reaches today; there is nothing to request.
    NoWindowNeeded { watermark: NaiveDate },
}

pub struct WindowPlanner {
    clock: Arc<dyn Clock>,
    floor: NaiveDate,
}

impl WindowPlanner {
    pub fn new(clock: Arc<dyn Clock>, floor: NaiveDate) -> Self {
        Self { clock, floor }
    }

    pub fn system(floor: NaiveDate) -> Self {
        Self::new(Arc::new(SystemClock), floor)
    }

    pub fn floor(&self) -> NaiveDate {
        self.floor
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Plan from a known watermark. Pure apart from reading the clock.
    pub fn plan(&self, watermark: NaiveDate) -> Plan {
        let end = self.clock.now();
        let start = if watermark == epoch_sentinel() {
            Some(self.floor)
        } else {
            watermark.succ_opt()
        };
        match start {
            Some(start) if start <= end.date_naive() => Plan::Fetch(Window { start, end }),
            _ => Plan::NoWindowNeeded { watermark },
        }
    }

    /// Read the symbol's watermark from the store and plan from it.
    pub fn plan_window(
        &self,
        db: &Db,
        series: PriceSeries,
        symbol: &str,
    ) -> Result<Plan, DbError> {
        let watermark = db.series_watermark(series, symbol)?;
        Ok(self.plan(watermark))
    }
}
