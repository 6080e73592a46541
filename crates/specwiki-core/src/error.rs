//! Crate-wide error type.
//!
//! Every public API returns [`CoreError`]; internal adapters may use
//! `anyhow::Context` and bubble up through the `Internal` variant.

use std::time::Duration;

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, CoreError>;

/// Error kinds for the pipelines and their collaborators
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{service} call timed out after {timeout:?}")]
    Timeout {
        service: &'static str,
        timeout: Duration,
    },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream rate limited: {0}")]
    UpstreamRateLimited(String),

    #[error("malformed upstream response: {0}")]
    UpstreamMalformedResponse(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Whether a single jittered retry is warranted.
    ///
    /// Only transport-level trouble is transient; a malformed response or a
    /// bad input will not get better on the second attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Timeout { .. }
            | CoreError::UpstreamUnavailable(_)
            | CoreError::UpstreamRateLimited(_) => true,
            CoreError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Error kind label for logging and persisted error messages
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "not_found",
            CoreError::PermissionDenied(_) => "permission_denied",
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::Config(_) => "config",
            CoreError::Timeout { .. } => "timeout",
            CoreError::UpstreamUnavailable(_) => "upstream_unavailable",
            CoreError::UpstreamRateLimited(_) => "upstream_rate_limited",
            CoreError::UpstreamMalformedResponse(_) => "upstream_malformed_response",
            CoreError::Conflict(_) => "conflict",
            CoreError::Cancelled => "cancelled",
            CoreError::Database(_) => "database",
            CoreError::Http(_) => "http",
            CoreError::Serialization(_) => "serialization",
            CoreError::Io(_) => "io",
            CoreError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(CoreError::Timeout {
            service: "vlm",
            timeout: Duration::from_secs(60)
        }
        .is_transient());
        assert!(CoreError::UpstreamUnavailable("503".into()).is_transient());
        assert!(CoreError::UpstreamRateLimited("429".into()).is_transient());
        assert!(!CoreError::UpstreamMalformedResponse("bad json".into()).is_transient());
        assert!(!CoreError::InvalidInput("empty".into()).is_transient());
        assert!(!CoreError::Cancelled.is_transient());
    }

    #[test]
    fn kind_labels() {
        assert_eq!(CoreError::Cancelled.kind(), "cancelled");
        assert_eq!(CoreError::Conflict("dup".into()).kind(), "conflict");
    }
}
