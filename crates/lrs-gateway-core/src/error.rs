//! Error types for the LRS gateway core.

use thiserror::Error;

/// Core errors raised while encoding or decoding gateway primitives.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Validation errors for queries, cursors, targets and statements.
///
/// These are request errors: they are surfaced immediately and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{identity} cannot be combined with the {field} filter")]
    ExclusiveFilter {
        identity: &'static str,
        field: &'static str,
    },

    #[error("statement_id and voided_statement_id are mutually exclusive")]
    ConflictingIdentityFilters,

    #[error("time range is inverted: since {since} is after until {until}")]
    InvertedTimeRange { since: String, until: String },

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("invalid target name: {0:?}")]
    InvalidTarget(String),

    #[error("invalid identity key: {0:?}")]
    InvalidIdentityKey(String),

    #[error("statement id {found} does not match requested id {expected}")]
    IdentityMismatch { expected: String, found: String },

    #[error("malformed statement: {0}")]
    MalformedStatement(String),

    #[error("unknown scope: {0:?}")]
    UnknownScope(String),

    #[error("statement {0} voids a voiding statement")]
    VoidingVoid(String),
}

impl From<CoreError> for ValidationError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::EncodingError(msg) | CoreError::DecodingError(msg) => {
                ValidationError::InvalidCursor(msg)
            }
        }
    }
}
