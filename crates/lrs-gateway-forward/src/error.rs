//! Error types for forwarding.

use std::time::Duration;

use thiserror::Error;

/// Errors from a single forwarding attempt or from forwarding configuration.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The attempt exceeded the target timeout.
    #[error("forwarding to {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },

    /// The target could not be reached.
    #[error("could not reach {url}: {reason}")]
    Connect { url: String, reason: String },

    /// The target answered with a non-success status.
    #[error("{url} answered HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    /// Statements could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A forwarding entry or setting is invalid.
    #[error("invalid forwarding configuration: {0}")]
    Configuration(String),

    /// The delivery task failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ForwardError {
    /// Worth another attempt: timeouts, connection failures, 5xx and 429.
    pub fn is_retryable(&self) -> bool {
        match self {
            ForwardError::Timeout { .. } | ForwardError::Connect { .. } => true,
            ForwardError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub(crate) fn from_http(url: &str, after: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ForwardError::Timeout {
                url: url.to_string(),
                after,
            }
        } else {
            ForwardError::Connect {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

/// Result type for forwarding operations.
pub type Result<T> = std::result::Result<T, ForwardError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> ForwardError {
        ForwardError::Status {
            url: "http://lrs.example.com".into(),
            status: code,
            body: String::new(),
        }
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(!ForwardError::Configuration("x".into()).is_retryable());
    }
}
