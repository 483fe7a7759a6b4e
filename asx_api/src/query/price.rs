//! Query builder for the historical price download endpoint.

use chrono::{DateTime, NaiveDate, Utc};
use url::Url;

use super::common::Query;

/// Uppercases a symbol and appends the exchange suffix (`BHP` -> `BHP.AX`).
///
/// Index symbols (leading `^`) and symbols that already carry a suffix are
/// returned uppercased but otherwise unchanged.
pub fn qualify_symbol(symbol: &str, suffix: &str) -> String {
    let symbol = symbol.trim().to_uppercase();
    if symbol.starts_with('^') || symbol.contains('.') || suffix.is_empty() {
        symbol
    } else {
        format!("{}.{}", symbol, suffix.trim_start_matches('.').to_uppercase())
    }
}

/// Parameters for one price download: a time range in UNIX seconds. Bars
/// are always daily.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PriceQuery {
    pub period1: i64,
    pub period2: i64,
    pub include_adjusted_close: bool,
}

impl Default for PriceQuery {
    fn default() -> Self {
        Self {
            period1: 0,
            period2: 0,
            include_adjusted_close: true,
        }
    }
}

impl PriceQuery {
    /// Start of the range: midnight UTC of `start`.
    pub fn with_start_date(mut self, start: NaiveDate) -> Self {
        self.period1 = start.and_hms_opt(0, 0, 0).map_or(0, |dt| dt.and_utc().timestamp());
        self
    }

    /// End of the range, usually "now".
    pub fn with_end(mut self, end: DateTime<Utc>) -> Self {
        self.period2 = end.timestamp();
        self
    }
}

impl Query for PriceQuery {
    fn add_to_url(&self, url: &Url) -> Url {
        let mut url = url.clone();
        url.query_pairs_mut()
            .append_pair("period1", &self.period1.to_string())
            .append_pair("period2", &self.period2.to_string())
            .append_pair("interval", "1d")
            .append_pair("events", "history");
        if self.include_adjusted_close {
            url.query_pairs_mut()
                .append_pair("includeAdjustedClose", "true");
        }
        url
    }
}
