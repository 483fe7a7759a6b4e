//! HTTP client for the ASX roster and the historical price download.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use url::Url;

use crate::{
    parse::{self, Parsed},
    query::{qualify_symbol, PriceQuery, Query},
    types::{Entity, PriceRow},
    user_agent::get_user_agent,
    Error,
};

pub const DEFAULT_ROSTER_URL: &str = "https://www.asx.com.au/asx/research/ASXListedCompanies.csv";
pub const DEFAULT_PRICE_BASE_URL: &str = "https://query1.finance.yahoo.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Title line, blank line and column header precede the roster rows.
pub const DEFAULT_ROSTER_PREAMBLE_ROWS: usize = 3;

/// HTTP client for the roster CSV and the per-symbol price CSV.
///
/// Sends requests with a browser-like user agent. Symbols are qualified with
/// the exchange suffix (`AX` by default) before hitting the price source.
pub struct Client {
    http: reqwest::Client,
    roster_url: String,
    price_base_url: String,
    exchange_suffix: String,
    roster_preamble_rows: usize,
}

impl Client {
    /// Creates a client pointing at the production sources.
    pub fn new() -> Result<Self, Error> {
        Self::with_base_urls(DEFAULT_ROSTER_URL, DEFAULT_PRICE_BASE_URL)
    }

    /// Creates a client with custom source URLs. Used for testing with wiremock.
    pub fn with_base_urls(roster_url: &str, price_base_url: &str) -> Result<Self, Error> {
        Ok(Self {
            http: build_http(DEFAULT_TIMEOUT)?,
            roster_url: roster_url.to_string(),
            price_base_url: price_base_url.trim_end_matches('/').to_string(),
            exchange_suffix: "AX".to_string(),
            roster_preamble_rows: DEFAULT_ROSTER_PREAMBLE_ROWS,
        })
    }

    pub fn with_exchange_suffix(mut self, suffix: &str) -> Self {
        self.exchange_suffix = suffix.to_string();
        self
    }

    pub fn with_roster_preamble_rows(mut self, rows: usize) -> Self {
        self.roster_preamble_rows = rows;
        self
    }

    /// Replaces the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, Error> {
        self.http = build_http(timeout)?;
        Ok(self)
    }

    pub fn exchange_suffix(&self) -> &str {
        &self.exchange_suffix
    }

    /// Builds the download URL for one symbol and time range.
    ///
    /// `period1` is midnight UTC of the day before `start`. The source stamps
    /// a bar at the exchange's session open, which for exchanges east of UTC
    /// falls on the previous UTC day, so midnight UTC of `start` itself would
    /// cut off the bar for `start`.
    pub fn price_url(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: DateTime<Utc>,
    ) -> Result<Url, Error> {
        // `^` is not a valid URI path character.
        let ticker = qualify_symbol(symbol, &self.exchange_suffix).replace('^', "%5E");
        let url = Url::parse(&format!(
            "{}/v7/finance/download/{}",
            self.price_base_url, ticker
        ))?;
        let from = start.pred_opt().unwrap_or(start);
        let query = PriceQuery::default().with_start_date(from).with_end(end);
        Ok(query.add_to_url(&url))
    }

    async fn get_text(&self, url: Url) -> Result<(reqwest::StatusCode, String), Error> {
        let resp = self
            .http
            .get(url.clone())
            .header("accept", "text/csv, text/plain, */*")
            .header("accept-language", "en-AU,en;q=0.9")
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to get {}: {}", url, e);
                Error::from(e)
            })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| {
            tracing::error!("Failed to read response body: {}", e);
            Error::from(e)
        })?;
        Ok((status, body))
    }

    /// Fetches and parses the listed-companies roster.
    pub async fn get_roster(&self) -> Result<Parsed<Entity>, Error> {
        let url = Url::parse(&self.roster_url)?;
        let (status, body) = self.get_text(url).await?;
        if !status.is_success() {
            let snippet = truncate_body(&body);
            tracing::error!("Roster request failed with status {}: {}", status, snippet);
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body: snippet,
            });
        }
        parse::parse_roster(&body, self.roster_preamble_rows)
    }

    /// Fetches daily bars for `symbol` between `start` (inclusive) and `end`.
    ///
    /// The request reaches one day before `start` (see [`Client::price_url`]),
    /// so rows dated before `start` may be returned; callers trim them.
    /// An unknown symbol, or a range with no data, is an empty result rather
    /// than an error.
    pub async fn get_prices(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: DateTime<Utc>,
    ) -> Result<Parsed<PriceRow>, Error> {
        let url = self.price_url(symbol, start, end)?;
        let (status, body) = self.get_text(url).await?;

        if status == reqwest::StatusCode::NOT_FOUND || is_no_data(status, &body) {
            tracing::debug!(symbol, "no price data in range");
            return Ok(Parsed::default());
        }

        if !status.is_success() {
            let snippet = truncate_body(&body);
            tracing::error!("Price request for {} failed with status {}: {}", symbol, status, snippet);
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body: snippet,
            });
        }

        parse::parse_prices(&body, &symbol.trim().to_uppercase())
    }
}

fn build_http(timeout: Duration) -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .user_agent(get_user_agent())
        .timeout(timeout)
        .build()
        .map_err(|e| {
            tracing::error!("Failed to build HTTP client: {}", e);
            Error::Network(e)
        })
}

/// The price source answers 400 when the range holds no bars.
fn is_no_data(status: reqwest::StatusCode, body: &str) -> bool {
    status == reqwest::StatusCode::BAD_REQUEST && body.contains("Data doesn't exist")
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 2000;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...[truncated]", &body[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let body = "é".repeat(1500);
        let out = truncate_body(&body);
        assert!(out.ends_with("...[truncated]"));
    }

    #[test]
    fn no_data_detection() {
        assert!(is_no_data(
            reqwest::StatusCode::BAD_REQUEST,
            "400 Bad Request: Data doesn't exist for startDate = 1, endDate = 2"
        ));
        assert!(!is_no_data(reqwest::StatusCode::BAD_REQUEST, "Invalid interval"));
    }
}
