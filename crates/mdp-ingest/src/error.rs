//! Error types for the ingestion core
//!
//! Two layers:
//!
//! - [`FetchError`]: source-scoped, produced by adapters and the resilience
//!   wrapper. Absorbed up to policy limits, then isolated to one source.
//! - [`IngestError`]: run-scoped. Anything here ends or prevents a run.
//!
//! Validation failures are not errors at all; they become
//! [`RejectionRecord`](mdp_common::types::RejectionRecord) data.

use mdp_common::MdpError;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a failed network operation against one source
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Timeout, 5xx, connection reset. Retried with backoff.
    #[error("Transient error: {0}")]
    Transient(String),

    /// HTTP 429 or a provider-specific throttle signal. Backed off, not counted as failure.
    #[error("Rate limited{}", .retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// Auth failure, malformed request or undecodable payload. Never retried.
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Produced locally while the source's breaker is open; no I/O happened
    #[error("Circuit open for source '{source_id}', retry in {}ms", .retry_in.as_millis())]
    CircuitOpen {
        source_id: String,
        retry_in: Duration,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: StatusCode, retry_after: Option<Duration>, context: &str) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimited { retry_after },
            StatusCode::REQUEST_TIMEOUT => {
                Self::Transient(format!("{} returned {}", context, status))
            },
            s if s.is_server_error() => Self::Transient(format!("{} returned {}", context, s)),
            s => Self::Fatal(format!("{} returned {}", context, s)),
        }
    }

    /// Whether the resilience wrapper may retry this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status, None, "request");
        }
        if err.is_timeout() {
            Self::Transient(format!("request timed out: {}", err))
        } else if err.is_connect() || err.is_request() || err.is_body() {
            Self::Transient(format!("connection failed: {}", err))
        } else if err.is_decode() {
            Self::Fatal(format!("undecodable response: {}", err))
        } else if err.is_builder() {
            Self::Fatal(format!("malformed request: {}", err))
        } else {
            Self::Transient(err.to_string())
        }
    }
}

/// Result type alias for source-scoped operations
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Run-scoped failures
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Output collaborator refused a write
    #[error("Sink error: {0}")]
    Sink(String),

    /// A non-source-scoped invariant was violated (e.g. a poisoned dedup lock)
    #[error("Internal invariant violated: {0}")]
    Internal(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<MdpError> for IngestError {
    fn from(err: MdpError) -> Self {
        match err {
            MdpError::Io(e) => Self::Io(e),
            MdpError::Serialization(e) => Self::Serialization(e),
            MdpError::Config(msg) | MdpError::InvalidBoundingBox(msg) => Self::Config(msg),
            MdpError::Parse(msg) => Self::Internal(msg),
        }
    }
}

/// Result type alias for run-scoped operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            FetchError::from_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(5)), "x"),
            FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(5))
            }
        );
        assert!(matches!(
            FetchError::from_status(StatusCode::SERVICE_UNAVAILABLE, None, "x"),
            FetchError::Transient(_)
        ));
        assert!(matches!(
            FetchError::from_status(StatusCode::REQUEST_TIMEOUT, None, "x"),
            FetchError::Transient(_)
        ));
        assert!(matches!(
            FetchError::from_status(StatusCode::UNAUTHORIZED, None, "x"),
            FetchError::Fatal(_)
        ));
        assert!(matches!(
            FetchError::from_status(StatusCode::NOT_FOUND, None, "x"),
            FetchError::Fatal(_)
        ));
    }

    #[test]
    fn test_retryable() {
        assert!(FetchError::transient("reset").is_retryable());
        assert!(FetchError::RateLimited { retry_after: None }.is_retryable());
        assert!(!FetchError::fatal("401").is_retryable());
        assert!(!FetchError::Cancelled.is_retryable());
    }

    #[test]
    fn test_rate_limited_display() {
        let err = FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(err.to_string(), "Rate limited (retry after 5s)");
    }
}
