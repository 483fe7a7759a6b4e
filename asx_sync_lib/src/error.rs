//! Error types for the library layer.

use std::fmt;

use serde::Serialize;

use crate::config::ConfigError;
use crate::db::DbError;

/// Whether a fetch failure is worth retrying on a later attempt or run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchErrorKind {
    Transient,
    Permanent,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

/// A failure reported by a [`crate::fetcher::RemoteFetcher`].
///
/// Carries a message rather than the upstream error so fetchers other than
/// the HTTP client (and test doubles) can produce one.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} fetch error: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FetchErrorKind::Transient
    }
}

impl From<asx_api::Error> for FetchError {
    fn from(e: asx_api::Error) -> Self {
        let kind = if e.is_transient() {
            FetchErrorKind::Transient
        } else {
            FetchErrorKind::Permanent
        };
        Self {
            kind,
            message: e.to_string(),
        }
    }
}

/// Errors that abort a whole run or command.
///
/// Per-entity problems never surface here; they are recorded in the run
/// summary instead.
#[derive(Debug)]
pub enum SyncError {
    /// The local store could not be opened, migrated, or read.
    Storage(DbError),
    /// Configuration failed to load or validate.
    Config(ConfigError),
    /// The HTTP client could not be constructed.
    Client(asx_api::Error),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "Storage error: {}", e),
            Self::Config(e) => write!(f, "Config error: {}", e),
            Self::Client(e) => write!(f, "Client error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Client(e) => Some(e),
        }
    }
}

impl From<DbError> for SyncError {
    fn from(e: DbError) -> Self {
        Self::Storage(e)
    }
}

impl From<ConfigError> for SyncError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<asx_api::Error> for SyncError {
    fn from(e: asx_api::Error) -> Self {
        Self::Client(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_status_maps_to_fetch_kind() {
        let busy = asx_api::Error::HttpStatus {
            status: 503,
            body: String::new(),
        };
        assert!(FetchError::from(busy).is_transient());

        let gone = asx_api::Error::HttpStatus {
            status: 401,
            body: "unauthorized".into(),
        };
        let err = FetchError::from(gone);
        assert_eq!(err.kind, FetchErrorKind::Permanent);
        assert!(err.to_string().starts_with("permanent fetch error"));
    }

    #[test]
    fn sync_error_keeps_source() {
        use std::error::Error as _;
        let err = SyncError::from(ConfigError::Invalid("concurrency must be at least 1".into()));
        assert!(err.to_string().starts_with("Config error"));
        assert!(err.source().is_some());
    }
}
