//! Opaque pagination cursors.
//!
//! A cursor is handed to callers as a hex string. Inside it is a
//! CBOR-encoded [`CursorPosition`]: the `(timestamp, id)` key of the last
//! record a page returned, plus optional adapter-native sort state that
//! only the adapter which produced it interprets.
//!
//! Positions are keyset positions, so resuming never depends on how many
//! records precede the position. Records voided between two fetches cannot
//! shift later records out of view.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, ValidationError};
use crate::types::IdentityKey;

/// Encoding version carried in every cursor.
pub const CURSOR_VERSION: u8 = 1;

/// Where a read resumes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub timestamp: DateTime<Utc>,
    pub id: IdentityKey,
    /// Adapter-native resume state (for example a search engine's sort
    /// values). Opaque outside the adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<Value>,
}

impl CursorPosition {
    pub fn new(timestamp: DateTime<Utc>, id: IdentityKey) -> Self {
        Self {
            timestamp,
            id,
            native: None,
        }
    }

    pub fn with_native(mut self, native: Option<Value>) -> Self {
        self.native = native;
        self
    }
}

/// An opaque continuation token.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Wrap a token exactly as a caller passed it back.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Encode a resume position.
    pub fn encode(position: &CursorPosition) -> Result<Self, CoreError> {
        let mut buf = Vec::new();
        ciborium::into_writer(&(CURSOR_VERSION, position), &mut buf)
            .map_err(|e| CoreError::EncodingError(e.to_string()))?;
        Ok(Self(hex::encode(buf)))
    }

    /// Decode the resume position.
    pub fn decode(&self) -> Result<CursorPosition, ValidationError> {
        let bytes = hex::decode(&self.0)
            .map_err(|e| ValidationError::InvalidCursor(e.to_string()))?;
        let (version, position): (u8, CursorPosition) = ciborium::from_reader(&bytes[..])
            .map_err(|e| ValidationError::InvalidCursor(e.to_string()))?;
        if version != CURSOR_VERSION {
            return Err(ValidationError::InvalidCursor(format!(
                "unsupported cursor version {version}"
            )));
        }
        Ok(position)
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.0.get(..16).unwrap_or(&self.0);
        write!(f, "Cursor({shown}..)")
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
