//! The backend capability model.
//!
//! Every adapter implements [`DataBackend`]: status and chunked reads.
//! Writing and listing are separate capabilities ([`Writable`],
//! [`Listable`]) that an adapter exposes through `as_writable` /
//! `as_listable`. Callers ask for a capability instead of assuming one.
//!
//! Adapters deal in single chunks. The lazy record stream and the batched,
//! concurrent write live in [`crate::pipeline`] and are reached through
//! [`BackendExt`](crate::pipeline::BackendExt).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use lrs_gateway_core::{CursorPosition, IdentityKey, ReadQuery, Statement, Target};

use crate::error::{Result, StoreError};

/// Health of a backend as seen from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Ok,
    /// Reachable but not fully healthy.
    Degraded,
    Unreachable,
}

/// What to do when a written record's identity key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnConflict {
    /// Reject the record.
    #[default]
    Fail,
    /// Keep the existing record and count the new one as skipped.
    Ignore,
    /// Replace the existing record.
    Overwrite,
}

impl OnConflict {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OnConflict::Fail => "fail",
            OnConflict::Ignore => "ignore",
            OnConflict::Overwrite => "overwrite",
        }
    }
}

impl fmt::Display for OnConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OnConflict {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fail" => Ok(OnConflict::Fail),
            "ignore" => Ok(OnConflict::Ignore),
            "overwrite" => Ok(OnConflict::Overwrite),
            other => Err(StoreError::Configuration(format!(
                "unknown on_conflict policy {other:?}"
            ))),
        }
    }
}

/// Static operating characteristics of an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendProfile {
    /// Default records per read request.
    pub read_chunk_size: usize,
    /// Default records per write batch.
    pub write_chunk_size: usize,
    /// Chunks fetched ahead of the consumer. 0 disables prefetching.
    pub prefetch: usize,
    /// Batches must reach the engine in submission order.
    pub ordered_writes: bool,
    /// The engine sorts; otherwise the adapter sorts the matched set itself.
    pub native_sort: bool,
    /// Timeout applied to every adapter call.
    pub timeout: Duration,
}

impl Default for BackendProfile {
    fn default() -> Self {
        Self {
            read_chunk_size: 500,
            write_chunk_size: 500,
            prefetch: 0,
            ordered_writes: false,
            native_sort: true,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Which optional capabilities an adapter exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub writable: bool,
    pub listable: bool,
}

/// A statement as read back from a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub key: IdentityKey,
    pub timestamp: DateTime<Utc>,
    pub statement: Statement,
    /// Adapter-native sort state for resuming after this record.
    pub native: Option<Value>,
}

impl StoredRecord {
    /// Derive key and timestamp from a persisted statement.
    pub fn from_statement(statement: Statement) -> Result<Self> {
        let key = statement.require_id()?;
        let timestamp = statement.require_timestamp()?;
        Ok(Self {
            key,
            timestamp,
            statement,
            native: None,
        })
    }

    /// Parse a statement persisted as JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_statement(Statement::from_value(value)?)
    }

    pub fn with_native(mut self, native: Option<Value>) -> Self {
        self.native = native;
        self
    }

    /// Resume position just after this record.
    pub fn position(&self) -> CursorPosition {
        CursorPosition::new(self.timestamp, self.key).with_native(self.native.clone())
    }
}

/// Result of writing one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Records the engine accepted.
    pub written: usize,
    /// Records left untouched because their key already existed.
    pub skipped: usize,
}

/// A lazy stream of target names.
pub type TargetStream = BoxStream<'static, Result<Target>>;

/// The base contract every adapter implements.
///
/// Adapters must be safe to share across concurrent reads and writes.
#[async_trait]
pub trait DataBackend: Send + Sync {
    /// Registry name of the adapter.
    fn name(&self) -> &'static str;

    fn profile(&self) -> &BackendProfile;

    /// Check backend health. Never fails; errors map to `Unreachable`.
    async fn status(&self, target: &Target) -> BackendStatus;

    /// Fetch up to `size` records matching `query`, in query order,
    /// strictly after `query.after` when set.
    ///
    /// Fewer than `size` records means the match set is exhausted.
    async fn read_chunk(
        &self,
        target: &Target,
        query: &ReadQuery,
        size: usize,
    ) -> Result<Vec<StoredRecord>>;

    /// Fetch the records with the given identity keys, in no particular
    /// order. Missing keys are simply absent from the result.
    async fn read_by_ids(&self, target: &Target, ids: &[IdentityKey])
        -> Result<Vec<StoredRecord>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Capabilities
    // ─────────────────────────────────────────────────────────────────────────

    fn as_writable(&self) -> Option<&dyn Writable> {
        None
    }

    fn as_listable(&self) -> Option<&dyn Listable> {
        None
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            writable: self.as_writable().is_some(),
            listable: self.as_listable().is_some(),
        }
    }
}

/// The write capability.
#[async_trait]
pub trait Writable: Send + Sync {
    /// Can the engine express this conflict policy?
    fn supports(&self, policy: OnConflict) -> bool;

    /// Write one batch, preserving the order of `batch`.
    ///
    /// Every statement carries its `id` and `timestamp`. Under
    /// [`OnConflict::Fail`] an existing key fails the batch with
    /// [`StoreError::BatchRejected`] naming the records not persisted.
    async fn write_batch(
        &self,
        target: &Target,
        batch: &[Statement],
        policy: OnConflict,
    ) -> Result<BatchOutcome>;
}

/// The list capability.
#[async_trait]
pub trait Listable: Send + Sync {
    /// Targets whose name starts with `prefix` (all targets when `None`).
    async fn list(&self, prefix: Option<&str>) -> Result<TargetStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_on_conflict_parse() {
        assert_eq!("overwrite".parse::<OnConflict>().unwrap(), OnConflict::Overwrite);
        assert!("upsert".parse::<OnConflict>().is_err());
        assert_eq!(OnConflict::default(), OnConflict::Fail);
    }

    #[test]
    fn test_stored_record_requires_id_and_timestamp() {
        let missing_ts = json!({ "id": "3b6d3c4e-5f1a-4c8b-9d2e-7a6b5c4d3e2f" }).to_string();
        assert!(StoredRecord::from_json(&missing_ts).is_err());

        let complete = json!({
            "id": "3b6d3c4e-5f1a-4c8b-9d2e-7a6b5c4d3e2f",
            "timestamp": "2024-03-01T10:00:00Z"
        })
        .to_string();
        let record = StoredRecord::from_json(&complete).unwrap();
        assert_eq!(record.position().id, record.key);
    }
}
