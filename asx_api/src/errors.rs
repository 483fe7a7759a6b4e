//! Error types for the data source client.

/// Errors that can occur when fetching from the roster or price source.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The request could not be sent or the body could not be read.
    #[error("Request failed: {0}")]
    Network(#[source] reqwest::Error),
    /// The request did not complete within the client timeout.
    #[error("Request timed out")]
    Timeout,
    /// The source returned a non-success status with a body snippet.
    #[error("Request failed with status {status}")]
    HttpStatus { status: u16, body: String },
    /// The payload does not have the expected shape.
    #[error("Malformed response: {0}")]
    Malformed(String),
    /// A request URL could not be constructed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl Error {
    /// Whether retrying the same request later may succeed.
    ///
    /// Network failures, timeouts, HTTP 429 and 5xx are transient. Other
    /// statuses and malformed payloads are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Self::Malformed(_) | Self::InvalidUrl(_) => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(e)
        }
    }
}
