//! Error types for the gateway.

use lrs_gateway_core::{IdentityKey, ValidationError};
use lrs_gateway_forward::ForwardError;
use lrs_gateway_store::StoreError;
use thiserror::Error;

/// Errors surfaced to gateway callers.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed query, cursor, target or statement.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The record validator refused a submitted record.
    #[error("statement {index} rejected: {reason}")]
    Rejected { index: usize, reason: String },

    /// The principal lacks a required scope.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Identity keys reused with different content.
    #[error("conflicting statements for ids {}", display_keys(.keys))]
    Conflict { keys: Vec<IdentityKey> },

    /// The backend could not be reached.
    #[error("backend {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    /// A backend operation timed out.
    #[error("backend {backend} timed out during {operation}")]
    Timeout {
        backend: String,
        operation: &'static str,
    },

    /// A write stopped part way. `unpersisted` lists every record that was
    /// not stored.
    #[error("write failed with {} statements not persisted: {source}", .unpersisted.len())]
    WriteFailed {
        persisted: usize,
        unpersisted: Vec<IdentityKey>,
        source: StoreError,
    },

    /// Unknown backend, unsupported policy or invalid settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Any other backend failure.
    #[error("storage error: {0}")]
    Store(StoreError),
}

fn display_keys(keys: &[IdentityKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl GatewayError {
    /// HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Validation(_) | GatewayError::Rejected { .. } => 400,
            GatewayError::Forbidden(_) => 403,
            GatewayError::Conflict { .. } => 409,
            GatewayError::Unavailable { .. } => 503,
            GatewayError::Timeout { .. } => 504,
            GatewayError::WriteFailed { source, .. } if source.is_unavailable() => 503,
            GatewayError::WriteFailed { source, .. } if source.is_timeout() => 504,
            GatewayError::WriteFailed { .. } => 500,
            GatewayError::Configuration(_) | GatewayError::Store(_) => 500,
        }
    }

    /// Keys of the submitted records that were not persisted, when known.
    pub fn unpersisted(&self) -> Option<&[IdentityKey]> {
        match self {
            GatewayError::WriteFailed { unpersisted, .. } => Some(unpersisted),
            _ => None,
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(e) => GatewayError::Validation(e),
            StoreError::Unavailable { backend, reason } => {
                GatewayError::Unavailable { backend, reason }
            }
            StoreError::Timeout {
                backend, operation, ..
            } => GatewayError::Timeout { backend, operation },
            StoreError::WriteAborted {
                persisted,
                unpersisted,
                source,
            } => GatewayError::WriteFailed {
                persisted,
                unpersisted,
                source: *source,
            },
            e @ (StoreError::UnknownBackend(_)
            | StoreError::UnsupportedConflictPolicy { .. }
            | StoreError::NotWritable(_)
            | StoreError::NotListable(_)
            | StoreError::Configuration(_)) => GatewayError::Configuration(e.to_string()),
            other => GatewayError::Store(other),
        }
    }
}

impl From<ForwardError> for GatewayError {
    fn from(err: ForwardError) -> Self {
        GatewayError::Configuration(err.to_string())
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        GatewayError::Configuration(err.to_string())
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            GatewayError::from(ValidationError::ConflictingIdentityFilters).http_status(),
            400
        );
        assert_eq!(GatewayError::Forbidden("x".into()).http_status(), 403);
        assert_eq!(GatewayError::Conflict { keys: vec![] }.http_status(), 409);
        let timeout = StoreError::Timeout {
            backend: "es".into(),
            operation: "read",
            after: Duration::from_secs(1),
        };
        assert_eq!(GatewayError::from(timeout).http_status(), 504);
        assert_eq!(
            GatewayError::from(StoreError::UnknownBackend("x".into())).http_status(),
            500
        );
    }

    #[test]
    fn test_write_abort_keeps_unpersisted_keys() {
        let key = IdentityKey::generate();
        let err = GatewayError::from(StoreError::WriteAborted {
            persisted: 3,
            unpersisted: vec![key],
            source: Box::new(StoreError::Unavailable {
                backend: "es".into(),
                reason: "down".into(),
            }),
        });
        assert_eq!(err.unpersisted(), Some(&[key][..]));
        assert_eq!(err.http_status(), 503);
    }
}
