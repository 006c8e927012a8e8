//! Error types for ue-lfs operations.

use std::time::Duration;

use thiserror::Error;

/// Result type for ue-lfs operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during LFS operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid LFS pointer format
    #[error("invalid LFS pointer: {0}")]
    InvalidPointer(String),

    /// OID parsing error
    #[error("invalid OID: {0}")]
    InvalidOid(String),

    /// Content does not hash to the digest it was stored or fetched under
    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// Transport-level HTTP failure (connection refused, reset, timeout)
    #[error("HTTP error: {0}")]
    Http(String),

    /// Server returned a 5xx error, a per-object batch error, or refused an
    /// object transfer
    #[error("LFS server error: {message} (code: {code})")]
    ServerError { code: u16, message: String },

    /// Server asked us to slow down
    #[error("rate limited by server")]
    Throttled { retry_after: Option<Duration> },

    /// Object not found locally or on the server
    #[error("object not found: {0}")]
    NotFound(String),

    /// Credentials missing or rejected
    #[error("authentication required")]
    AuthRequired,

    /// Server response violates the protocol contract
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Path is locked by somebody else
    #[error("{path} is locked by {owner}")]
    LockConflict { path: String, owner: String },

    /// A transfer action expired before it could be used
    #[error("transfer action for {0} has expired")]
    Expired(String),

    /// A transfer gave up after exhausting its retries
    #[error("transfer of {oid} failed: {source}")]
    Transfer {
        oid: String,
        #[source]
        source: Box<Error>,
    },

    /// Operation was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid URL
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl Error {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) | Error::Throttled { .. } => true,
            Error::ServerError { code, .. } => *code >= 500,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Whether the error aborts a whole batch instead of a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::AuthRequired | Error::Protocol(_))
    }

    /// Whether the operation was stopped by cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Transfer { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Server-requested delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(401, _) | ureq::Error::Status(403, _) => Error::AuthRequired,
            ureq::Error::Status(404, _) => Error::NotFound("object not found".into()),
            ureq::Error::Status(429, response) => {
                let retry_after = response
                    .header("Retry-After")
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                Error::Throttled { retry_after }
            }
            ureq::Error::Status(code, response) => {
                let message = response
                    .into_string()
                    .unwrap_or_else(|_| "unknown error".into());
                if code >= 500 {
                    Error::ServerError { code, message }
                } else {
                    Error::Protocol(format!("unexpected status {}: {}", code, message))
                }
            }
            other => Error::Http(other.to_string()),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Config(err.to_string())
    }
}
