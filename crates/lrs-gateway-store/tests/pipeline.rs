//! Pipeline behavior against an instrumented in-memory backend.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use proptest::prelude::*;
use serde_json::json;

use lrs_gateway_core::{format_timestamp, IdentityKey, ReadQuery, Statement, Target};
use lrs_gateway_store::{
    BackendExt, BackendProfile, BackendStatus, BatchOutcome, DataBackend, MemoryBackend,
    OnConflict, ReadOptions, StoreError, StoredRecord, Writable, WriteOptions,
};

// ─────────────────────────────────────────────────────────────────────────────
// Instrumented backend
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Knobs {
    read_delay: Option<Duration>,
    write_delay: Option<Duration>,
    /// Batches containing one of these keys fail.
    poisoned: HashSet<IdentityKey>,
    /// Persist the rest of a poisoned batch and reject only the poisoned keys.
    partial: bool,
    no_overwrite: bool,
}

struct Instrumented {
    inner: MemoryBackend,
    profile: BackendProfile,
    knobs: Mutex<Knobs>,
    read_calls: AtomicUsize,
    write_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Instrumented {
    fn new(profile: BackendProfile) -> Arc<Self> {
        Self::with_knobs(profile, Knobs::default())
    }

    fn with_knobs(profile: BackendProfile, knobs: Knobs) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryBackend::with_profile(profile.clone()),
            profile,
            knobs: Mutex::new(knobs),
            read_calls: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn reads(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataBackend for Instrumented {
    fn name(&self) -> &'static str {
        "instrumented"
    }

    fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    async fn status(&self, target: &Target) -> BackendStatus {
        self.inner.status(target).await
    }

    async fn read_chunk(
        &self,
        target: &Target,
        query: &ReadQuery,
        size: usize,
    ) -> lrs_gateway_store::Result<Vec<StoredRecord>> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.knobs.lock().unwrap().read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.read_chunk(target, query, size).await
    }

    async fn read_by_ids(
        &self,
        target: &Target,
        ids: &[IdentityKey],
    ) -> lrs_gateway_store::Result<Vec<StoredRecord>> {
        self.inner.read_by_ids(target, ids).await
    }

    fn as_writable(&self) -> Option<&dyn Writable> {
        Some(self)
    }
}

#[async_trait]
impl Writable for Instrumented {
    fn supports(&self, policy: OnConflict) -> bool {
        !(self.knobs.lock().unwrap().no_overwrite && policy == OnConflict::Overwrite)
    }

    async fn write_batch(
        &self,
        target: &Target,
        batch: &[Statement],
        policy: OnConflict,
    ) -> lrs_gateway_store::Result<BatchOutcome> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let (delay, poisoned, partial) = {
            let knobs = self.knobs.lock().unwrap();
            (knobs.write_delay, knobs.poisoned.clone(), knobs.partial)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let rejected: Vec<IdentityKey> = batch
            .iter()
            .filter_map(Statement::id)
            .filter(|key| poisoned.contains(key))
            .collect();
        let result = if rejected.is_empty() {
            self.inner.write_batch(target, batch, policy).await
        } else if partial {
            let accepted: Vec<Statement> = batch
                .iter()
                .filter(|s| !s.id().is_some_and(|key| poisoned.contains(&key)))
                .cloned()
                .collect();
            self.inner.write_batch(target, &accepted, policy).await?;
            Err(StoreError::BatchRejected {
                keys: rejected,
                reason: "poisoned".to_string(),
            })
        } else {
            Err(StoreError::Unavailable {
                backend: "instrumented".to_string(),
                reason: "poisoned batch".to_string(),
            })
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn statements(n: usize) -> Vec<Statement> {
    let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    (0..n)
        .map(|i| {
            let timestamp = base + chrono::Duration::seconds(i as i64);
            Statement::from_value(json!({
                "id": IdentityKey::generate().to_string(),
                "actor": { "mbox": "mailto:learner@example.com" },
                "verb": { "id": "http://adlnet.gov/expapi/verbs/experienced" },
                "object": { "id": format!("http://example.com/activities/{i}") },
                "timestamp": format_timestamp(&timestamp)
            }))
            .unwrap()
        })
        .collect()
}

fn profile(read_chunk: usize, write_chunk: usize) -> BackendProfile {
    BackendProfile {
        read_chunk_size: read_chunk,
        write_chunk_size: write_chunk,
        timeout: Duration::from_secs(5),
        ..BackendProfile::default()
    }
}

fn target() -> Target {
    Target::default()
}

async fn seed(backend: &Arc<Instrumented>, records: Vec<Statement>) {
    backend
        .write(&target(), records, WriteOptions::default())
        .await
        .unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_read_resumes_by_keyset_and_honors_limit() {
    let backend = Instrumented::new(profile(7, 100));
    let records = statements(25);
    seed(&backend, records.clone()).await;

    let read = backend
        .read_all(&target(), ReadQuery::default(), ReadOptions::limit(20))
        .await
        .unwrap();

    assert_eq!(read.len(), 20);
    // Newest first, no duplicates across chunk boundaries.
    let expected: Vec<&Statement> = records.iter().rev().take(20).collect();
    let got: Vec<&Statement> = read.iter().map(|r| &r.statement).collect();
    assert_eq!(got, expected);
    // 7 + 7 + 6
    assert_eq!(backend.reads(), 3);
}

#[tokio::test]
async fn test_read_ascending_exhausts_match_set() {
    let backend = Instrumented::new(profile(4, 100));
    let records = statements(10);
    seed(&backend, records.clone()).await;

    let query = ReadQuery {
        ascending: true,
        ..ReadQuery::default()
    };
    let read = backend
        .read_all(&target(), query, ReadOptions::default())
        .await
        .unwrap();
    let got: Vec<Statement> = read.into_iter().map(|r| r.statement).collect();
    assert_eq!(got, records);
    // Two full chunks, then a short one.
    assert_eq!(backend.reads(), 3);
}

#[tokio::test]
async fn test_prefetch_is_bounded_and_stops_on_drop() {
    let backend = Instrumented::new(profile(1, 100));
    seed(&backend, statements(30)).await;

    let options = ReadOptions {
        prefetch: Some(2),
        ..ReadOptions::default()
    };
    let mut stream = backend.read(&target(), ReadQuery::default(), options);
    assert!(stream.next().await.unwrap().is_ok());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let ahead = backend.reads();
    // One consumed chunk, two queued, one waiting to be handed over.
    assert!(ahead <= 4, "producer ran {ahead} chunks ahead");

    drop(stream);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let after_drop = backend.reads();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.reads(), after_drop);
    assert!(after_drop <= ahead + 1);
}

#[tokio::test]
async fn test_read_chunk_timeout_is_distinct_error() {
    let knobs = Knobs {
        read_delay: Some(Duration::from_millis(200)),
        ..Knobs::default()
    };
    let backend = Instrumented::with_knobs(
        BackendProfile {
            timeout: Duration::from_millis(20),
            ..profile(10, 10)
        },
        knobs,
    );

    let err = backend
        .read_all(&target(), ReadQuery::default(), ReadOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err}");
}

// ─────────────────────────────────────────────────────────────────────────────
// Writes
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unsupported_policy_fails_before_io() {
    let backend = Instrumented::with_knobs(
        profile(10, 10),
        Knobs {
            no_overwrite: true,
            ..Knobs::default()
        },
    );
    let err = backend
        .write(
            &target(),
            statements(3),
            WriteOptions {
                on_conflict: OnConflict::Overwrite,
                ..WriteOptions::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::UnsupportedConflictPolicy { .. }));
    assert_eq!(backend.write_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_ordered_writes_force_single_batch_in_flight() {
    let backend = Instrumented::with_knobs(
        BackendProfile {
            ordered_writes: true,
            ..profile(10, 2)
        },
        Knobs {
            write_delay: Some(Duration::from_millis(5)),
            ..Knobs::default()
        },
    );
    let options = WriteOptions {
        concurrency: 4,
        ..WriteOptions::default()
    };
    let report = backend.write(&target(), statements(10), options).await.unwrap();

    assert_eq!(report.written, 10);
    assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrency_bounds_batches_in_flight() {
    let backend = Instrumented::with_knobs(
        profile(10, 2),
        Knobs {
            write_delay: Some(Duration::from_millis(5)),
            ..Knobs::default()
        },
    );
    let options = WriteOptions {
        concurrency: 3,
        ..WriteOptions::default()
    };
    backend.write(&target(), statements(20), options).await.unwrap();

    assert!(backend.max_in_flight.load(Ordering::SeqCst) <= 3);
    assert_eq!(backend.write_calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_write_abort_reports_exact_unpersisted_keys() {
    let records = statements(10);
    let keys: Vec<IdentityKey> = records.iter().map(|s| s.id().unwrap()).collect();
    let backend = Instrumented::with_knobs(
        profile(10, 2),
        Knobs {
            poisoned: HashSet::from([keys[5]]),
            ..Knobs::default()
        },
    );

    let err = backend
        .write(&target(), records, WriteOptions::default())
        .await
        .unwrap_err();

    let StoreError::WriteAborted {
        persisted,
        unpersisted,
        source,
    } = err
    else {
        panic!("expected WriteAborted");
    };
    assert_eq!(persisted, 4);
    assert!(source.is_unavailable());
    let unpersisted: HashSet<IdentityKey> = unpersisted.into_iter().collect();
    assert_eq!(unpersisted, keys[4..].iter().copied().collect());
    assert_eq!(backend.inner.len(&target()), 4);
}

#[tokio::test]
async fn test_default_write_rejects_existing_keys() {
    let backend = Instrumented::new(profile(10, 10));
    let records = statements(3);
    seed(&backend, records.clone()).await;

    let err = backend
        .write(&target(), records, WriteOptions::default())
        .await
        .unwrap_err();
    let StoreError::WriteAborted { persisted, source, .. } = err else {
        panic!("expected WriteAborted");
    };
    assert_eq!(persisted, 0);
    assert!(matches!(*source, StoreError::BatchRejected { .. }), "unexpected source: {source}");
    assert_eq!(backend.inner.len(&target()), 3);
}

#[tokio::test]
async fn test_partial_batch_rejection_counts_accepted_records() {
    let records = statements(6);
    let keys: Vec<IdentityKey> = records.iter().map(|s| s.id().unwrap()).collect();
    let backend = Instrumented::with_knobs(
        profile(10, 3),
        Knobs {
            poisoned: HashSet::from([keys[1]]),
            partial: true,
            ..Knobs::default()
        },
    );

    let err = backend
        .write(&target(), records, WriteOptions::default())
        .await
        .unwrap_err();

    let StoreError::WriteAborted {
        persisted,
        unpersisted,
        ..
    } = err
    else {
        panic!("expected WriteAborted");
    };
    assert_eq!(persisted, 2);
    let unpersisted: HashSet<IdentityKey> = unpersisted.into_iter().collect();
    let expected: HashSet<IdentityKey> = [keys[1], keys[3], keys[4], keys[5]].into();
    assert_eq!(unpersisted, expected);
    assert_eq!(backend.inner.len(&target()), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_chunked_write_is_complete(n in 0usize..60, k in 1usize..8, c in 1usize..4) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let backend = Instrumented::new(profile(16, k));
            let records = statements(n);
            let options = WriteOptions { concurrency: c, ..WriteOptions::default() };

            let report = backend.write(&target(), records.clone(), options).await.unwrap();
            assert_eq!(report.submitted, n);
            assert_eq!(report.written, n);
            assert_eq!(report.skipped, 0);
            assert_eq!(backend.write_calls.load(Ordering::SeqCst), n.div_ceil(k));

            let read = backend
                .read_all(&target(), ReadQuery { ascending: true, ..ReadQuery::default() }, ReadOptions::default())
                .await
                .unwrap();
            let got: Vec<Statement> = read.into_iter().map(|r| r.statement).collect();
            assert_eq!(got, records);
        });
    }
}
