//! Run configuration.
//!
//! Defaults, optionally overlaid by a TOML file, then by `ASXSYNC_*`
//! environment variables. The CLI applies its flags last.

use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use rand::Rng;
use serde::Deserialize;

/// Errors from loading or validating configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Backoff policy for transient fetch failures.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2000,
            max_delay_ms: 30000,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Exponential backoff with +/-20% jitter, capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let shift = (attempt.saturating_sub(1)).min(30) as u32;
        let exp = 1u64 << shift;
        let base = self
            .base_delay_ms
            .saturating_mul(exp)
            .min(self.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_millis((base as f64 * jitter) as u64)
    }
}

pub fn default_history_floor() -> NaiveDate {
    NaiveDate::from_ymd_opt(1971, 1, 23).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// First day requested for a symbol with no stored history.
    pub history_floor: NaiveDate,
    /// Number of concurrent price fetches. 1 runs entities one at a time.
    pub concurrency: usize,
    /// Upper bound on one entity's fetch, retries included.
    pub fetch_timeout_secs: u64,
    /// Minimum spacing between requests to the data source.
    pub request_delay_ms: u64,
    pub roster_preamble_rows: usize,
    pub exchange_suffix: String,
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_floor: default_history_floor(),
            concurrency: 1,
            fetch_timeout_secs: 60,
            request_delay_ms: 250,
            roster_preamble_rows: 3,
            exchange_suffix: "AX".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply `ASXSYNC_*` environment variables on top of this config.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable values are
    /// an error rather than being silently ignored.
    pub fn with_overrides<L>(mut self, lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ASXSYNC_HISTORY_FLOOR") {
            self.history_floor = NaiveDate::parse_from_str(&v, "%Y-%m-%d")
                .map_err(|e| invalid("ASXSYNC_HISTORY_FLOOR", &v, e))?;
        }
        override_parsed(&lookup, "ASXSYNC_CONCURRENCY", &mut self.concurrency)?;
        override_parsed(&lookup, "ASXSYNC_FETCH_TIMEOUT_SECS", &mut self.fetch_timeout_secs)?;
        override_parsed(&lookup, "ASXSYNC_REQUEST_DELAY_MS", &mut self.request_delay_ms)?;
        override_parsed(&lookup, "ASXSYNC_ROSTER_PREAMBLE_ROWS", &mut self.roster_preamble_rows)?;
        if let Some(v) = lookup("ASXSYNC_EXCHANGE_SUFFIX") {
            self.exchange_suffix = v;
        }
        override_parsed(&lookup, "ASXSYNC_RETRY_MAX", &mut self.retry.max_retries)?;
        override_parsed(&lookup, "ASXSYNC_RETRY_BASE_MS", &mut self.retry.base_delay_ms)?;
        override_parsed(&lookup, "ASXSYNC_RETRY_MAX_MS", &mut self.retry.max_delay_ms)?;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "fetch_timeout_secs must be at least 1".into(),
            ));
        }
        if self.exchange_suffix.trim().is_empty() {
            return Err(ConfigError::Invalid("exchange_suffix must not be empty".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms exceeds retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }
}

fn invalid(key: &str, value: &str, err: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid(format!("{}={:?}: {}", key, value, err))
}

fn override_parsed<L, T>(lookup: &L, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    L: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(v) = lookup(key) {
        *target = v.trim().parse().map_err(|e| invalid(key, &v, e))?;
    }
    Ok(())
}
