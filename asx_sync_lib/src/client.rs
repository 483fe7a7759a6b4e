//! Retrying and rate-limiting wrapper around the HTTP client.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use asx_api::types::{Entity, PriceRow};
use asx_api::Client;
use tokio::time::Instant;

use crate::config::{RetryConfig, SyncConfig};
use crate::error::FetchError;
use crate::fetcher::RemoteFetcher;
use crate::planner::Window;

/// [`RemoteFetcher`] backed by [`asx_api::Client`].
///
/// Consecutive requests are spaced by at least `request_delay`. Transient
/// failures (network, timeouts, 429, 5xx) are retried with exponential backoff;
/// anything else is returned immediately.
pub struct RetryingClient {
    inner: Client,
    retry: RetryConfig,
    request_delay: Duration,
    /// Earliest instant the next request may be sent.
    next_slot: Mutex<Option<Instant>>,
}

impl RetryingClient {
    pub fn new(inner: Client, retry: RetryConfig) -> Self {
        Self {
            inner,
            retry,
            request_delay: Duration::ZERO,
            next_slot: Mutex::new(None),
        }
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    /// Builds a client from run configuration. `None` URLs use the production sources.
    pub fn from_config(
        config: &SyncConfig,
        roster_url: Option<&str>,
        price_base_url: Option<&str>,
    ) -> Result<Self, asx_api::Error> {
        let inner = match (roster_url, price_base_url) {
            (None, None) => Client::new()?,
            (roster, price) => Client::with_base_urls(
                roster.unwrap_or(asx_api::DEFAULT_ROSTER_URL),
                price.unwrap_or(asx_api::DEFAULT_PRICE_BASE_URL),
            )?,
        };
        let inner = inner
            .with_exchange_suffix(&config.exchange_suffix)
            .with_roster_preamble_rows(config.roster_preamble_rows)
            .with_timeout(config.fetch_timeout())?;
        Ok(Self::new(inner, config.retry.clone()).with_request_delay(config.request_delay()))
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    /// Waits for this request's slot. Slots are reserved under the lock, so
    /// concurrent callers are spaced by `request_delay` too.
    async fn rate_limit(&self) {
        let slot = {
            let mut next = self.next_slot.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            let slot = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(slot + self.request_delay);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }

    async fn with_retry<T, F, Fut>(&self, label: &str, mut f: F) -> Result<T, asx_api::Error>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, asx_api::Error>>,
    {
        let mut attempt = 0usize;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt > self.retry.max_retries || !err.is_transient() {
                        return Err(err);
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        "{} request failed (attempt {}/{}): {}; retrying in {:.1}s",
                        label,
                        attempt,
                        self.retry.max_retries,
                        err,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl RemoteFetcher for RetryingClient {
    async fn fetch_entity_roster(&self) -> Result<Vec<Entity>, FetchError> {
        let parsed = self
            .with_retry("roster", || async {
                self.rate_limit().await;
                self.inner.get_roster().await
            })
            .await?;
        if parsed.rejected > 0 {
            tracing::warn!(rejected = parsed.rejected, "skipped malformed roster rows");
        }
        Ok(parsed.rows)
    }

    async fn fetch_prices(
        &self,
        symbol: &str,
        window: &Window,
    ) -> Result<Vec<PriceRow>, FetchError> {
        let label = format!("prices {}", symbol);
        let parsed = self
            .with_retry(&label, || async {
                self.rate_limit().await;
                self.inner.get_prices(symbol, window.start, window.end).await
            })
            .await?;
        if parsed.rejected > 0 {
            tracing::warn!(symbol, rejected = parsed.rejected, "skipped malformed price rows");
        }
        Ok(parsed.rows)
    }
}
