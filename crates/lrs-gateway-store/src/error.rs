//! Error types for the store module.

use std::time::Duration;

use lrs_gateway_core::{IdentityKey, ValidationError};
use thiserror::Error;

use crate::backend::OnConflict;

/// Errors that can occur during backend operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Statement serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A request or record failed validation.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The backend could not be reached.
    #[error("backend {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    /// An operation exceeded its timeout.
    #[error("backend {backend} timed out during {operation} after {after:?}")]
    Timeout {
        backend: String,
        operation: &'static str,
        after: Duration,
    },

    /// The backend answered but refused the request.
    #[error("backend {backend} rejected the request: {reason}")]
    Rejected { backend: String, reason: String },

    /// Some records of a batch were refused. `keys` lists them.
    #[error("{} records rejected: {reason}", .keys.len())]
    BatchRejected {
        keys: Vec<IdentityKey>,
        reason: String,
    },

    /// The backend cannot honor the requested conflict policy.
    #[error("backend {backend} does not support on_conflict={policy}")]
    UnsupportedConflictPolicy { backend: String, policy: OnConflict },

    /// The backend lacks the writable capability.
    #[error("backend {0} is not writable")]
    NotWritable(String),

    /// The backend lacks the listable capability.
    #[error("backend {0} is not listable")]
    NotListable(String),

    /// No backend was registered under this name.
    #[error("unknown backend: {0:?}")]
    UnknownBackend(String),

    /// Backend construction or settings error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A chunked write stopped early.
    #[error("write aborted with {persisted} records persisted and {} not persisted: {source}", .unpersisted.len())]
    WriteAborted {
        persisted: usize,
        unpersisted: Vec<IdentityKey>,
        source: Box<StoreError>,
    },

    /// A background task failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Build the error for a failed HTTP exchange with a backend.
    pub(crate) fn from_http(backend: &str, operation: &'static str, after: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Timeout {
                backend: backend.to_string(),
                operation,
                after,
            }
        } else if err.is_connect() || err.is_request() {
            StoreError::Unavailable {
                backend: backend.to_string(),
                reason: err.to_string(),
            }
        } else if err.is_decode() {
            StoreError::Serialization(err.to_string())
        } else {
            StoreError::Rejected {
                backend: backend.to_string(),
                reason: err.to_string(),
            }
        }
    }

    /// Is this a backend-unreachable condition?
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
