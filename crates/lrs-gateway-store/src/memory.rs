//! In-memory backend.
//!
//! Mostly for tests and development. It has the same semantics as the
//! SQLite backend but keeps everything in memory: one map of statements
//! per target plus an ordered `(timestamp, id)` index for sorted reads.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};

use lrs_gateway_core::{IdentityKey, ReadQuery, Statement, Target};

use crate::backend::{
    BackendProfile, BackendStatus, BatchOutcome, DataBackend, Listable, OnConflict,
    StoredRecord, TargetStream, Writable,
};
use crate::error::{Result, StoreError};
use crate::settings::MemorySettings;
use crate::translate::predicate;

type OrderKey = (DateTime<Utc>, IdentityKey);

#[derive(Default)]
struct Partition {
    records: HashMap<IdentityKey, StoredRecord>,
    order: BTreeSet<OrderKey>,
}

impl Partition {
    fn insert(&mut self, record: StoredRecord) {
        if let Some(previous) = self.records.remove(&record.key) {
            self.order.remove(&(previous.timestamp, previous.key));
        }
        self.order.insert((record.timestamp, record.key));
        self.records.insert(record.key, record);
    }
}

/// In-memory backend. All data is lost when it is dropped.
pub struct MemoryBackend {
    profile: BackendProfile,
    partitions: RwLock<BTreeMap<Target, Partition>>,
    available: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_settings(&MemorySettings::default())
    }

    pub fn with_settings(settings: &MemorySettings) -> Self {
        Self::with_profile(settings.profile())
    }

    pub fn with_profile(profile: BackendProfile) -> Self {
        Self {
            profile,
            partitions: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of records stored in `target`.
    pub fn len(&self, target: &Target) -> usize {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .map_or(0, |p| p.records.len())
    }

    pub fn is_empty(&self, target: &Target) -> bool {
        self.len(target) == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                backend: self.name().to_string(),
                reason: "backend marked unavailable".to_string(),
            })
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    async fn status(&self, _target: &Target) -> BackendStatus {
        if self.available.load(Ordering::SeqCst) {
            BackendStatus::Ok
        } else {
            BackendStatus::Unreachable
        }
    }

    async fn read_chunk(
        &self,
        target: &Target,
        query: &ReadQuery,
        size: usize,
    ) -> Result<Vec<StoredRecord>> {
        self.check_available()?;
        let partitions = self.partitions.read().unwrap_or_else(PoisonError::into_inner);
        let Some(partition) = partitions.get(target) else {
            return Ok(Vec::new());
        };

        let predicates = predicate::lower(query, size);

        // Walk the index from the resume position in query order.
        let (lower, upper) = match (&query.after, query.ascending) {
            (Some(after), true) => (Bound::Excluded((after.timestamp, after.id)), Bound::Unbounded),
            (Some(after), false) => (Bound::Unbounded, Bound::Excluded((after.timestamp, after.id))),
            (None, _) => (Bound::Unbounded, Bound::Unbounded),
        };
        let range = partition.order.range((lower, upper));
        let keys: Box<dyn Iterator<Item = &OrderKey>> = if query.ascending {
            Box::new(range)
        } else {
            Box::new(range.rev())
        };

        Ok(keys
            .filter_map(|(_, key)| partition.records.get(key))
            .filter(|record| predicates.matches(record))
            .take(size)
            .cloned()
            .collect())
    }

    async fn read_by_ids(&self, target: &Target, ids: &[IdentityKey]) -> Result<Vec<StoredRecord>> {
        self.check_available()?;
        let partitions = self.partitions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(partitions
            .get(target)
            .map(|partition| {
                ids.iter()
                    .filter_map(|id| partition.records.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn as_writable(&self) -> Option<&dyn Writable> {
        Some(self)
    }

    fn as_listable(&self) -> Option<&dyn Listable> {
        Some(self)
    }
}

#[async_trait]
impl Writable for MemoryBackend {
    fn supports(&self, _policy: OnConflict) -> bool {
        true
    }

    async fn write_batch(
        &self,
        target: &Target,
        batch: &[Statement],
        policy: OnConflict,
    ) -> Result<BatchOutcome> {
        self.check_available()?;
        let records = batch
            .iter()
            .cloned()
            .map(StoredRecord::from_statement)
            .collect::<Result<Vec<_>>>()?;

        let mut partitions = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
        let partition = partitions.entry(target.clone()).or_default();

        if policy == OnConflict::Fail {
            let mut seen = BTreeSet::new();
            let clash = records
                .iter()
                .any(|r| partition.records.contains_key(&r.key) || !seen.insert(r.key));
            if clash {
                return Err(StoreError::BatchRejected {
                    keys: records.iter().map(|r| r.key).collect(),
                    reason: "identity key already exists".to_string(),
                });
            }
        }

        let mut outcome = BatchOutcome::default();
        for record in records {
            if policy == OnConflict::Ignore && partition.records.contains_key(&record.key) {
                outcome.skipped += 1;
                continue;
            }
            partition.insert(record);
            outcome.written += 1;
        }
        Ok(outcome)
    }
}

#[async_trait]
impl Listable for MemoryBackend {
    async fn list(&self, prefix: Option<&str>) -> Result<TargetStream> {
        self.check_available()?;
        let targets: Vec<Target> = self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|t| prefix.map_or(true, |p| t.as_str().starts_with(p)))
            .cloned()
            .collect();
        Ok(stream::iter(targets.into_iter().map(Ok)).boxed())
    }
}
