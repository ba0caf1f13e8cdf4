//! The chunked streaming pipeline.
//!
//! Reads become a lazy [`RecordStream`] over successive `read_chunk`
//! calls, optionally prefetched by a producer task into a bounded queue.
//! Writes are split into batches with a bounded number in flight.
//!
//! ## Reads
//!
//! Each chunk resumes strictly after the last record of the previous one
//! (keyset position), so a stream never depends on offsets. The stream ends
//! when a chunk comes back short or the limit is reached. With
//! `prefetch = n` the producer holds at most `n` chunks in the queue plus
//! one it is trying to hand over; dropping the stream closes the queue and
//! the producer stops at its next await point.
//!
//! ## Writes
//!
//! At most `concurrency` batches run at once (one for adapters with
//! `ordered_writes`). The first failure stops submission; batches already
//! in flight complete, and the error names every identity key that was not
//! persisted. Batches are spawned tasks, so they also complete when the
//! caller drops the write future.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, FuturesUnordered, StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use lrs_gateway_core::{IdentityKey, ReadQuery, Statement, Target};

use crate::backend::{BatchOutcome, DataBackend, OnConflict, StoredRecord};
use crate::error::{Result, StoreError};

/// A lazy, finite, non-restartable sequence of records.
pub type RecordStream = BoxStream<'static, Result<StoredRecord>>;

/// Per-read overrides of the adapter profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub chunk_size: Option<usize>,
    pub prefetch: Option<usize>,
    /// Stop after this many records.
    pub limit: Option<usize>,
}

impl ReadOptions {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

/// Per-write settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Records per batch. Defaults to the adapter profile.
    pub chunk_size: Option<usize>,
    /// Maximum batches in flight.
    pub concurrency: usize,
    pub on_conflict: OnConflict,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            chunk_size: None,
            concurrency: 1,
            on_conflict: OnConflict::default(),
        }
    }
}

/// Outcome of a completed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub target: Target,
    pub submitted: usize,
    /// Records the backend accepted.
    pub written: usize,
    /// Records skipped because their key already existed.
    pub skipped: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────────────────────────

struct ChunkReader<B: ?Sized> {
    backend: Arc<B>,
    target: Target,
    query: ReadQuery,
    chunk_size: usize,
    remaining: Option<usize>,
    timeout: Duration,
    done: bool,
}

impl<B: DataBackend + ?Sized> ChunkReader<B> {
    /// Fetch the next chunk, or `None` once the match set is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Vec<StoredRecord>>> {
        if self.done {
            return Ok(None);
        }
        let size = match self.remaining {
            Some(remaining) => remaining.min(self.chunk_size),
            None => self.chunk_size,
        };
        if size == 0 {
            self.done = true;
            return Ok(None);
        }

        let fetch = self.backend.read_chunk(&self.target, &self.query, size);
        let records = match tokio::time::timeout(self.timeout, fetch).await {
            Ok(result) => result?,
            Err(_) => {
                self.done = true;
                return Err(StoreError::Timeout {
                    backend: self.backend.name().to_string(),
                    operation: "read",
                    after: self.timeout,
                });
            }
        };
        debug!(
            backend = self.backend.name(),
            target = %self.target,
            requested = size,
            received = records.len(),
            "read chunk"
        );

        if records.len() < size {
            self.done = true;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(records.len());
        }
        match records.last() {
            Some(last) => {
                self.query.after = Some(last.position());
                Ok(Some(records))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }
}

fn flatten(chunks: BoxStream<'static, Result<Vec<StoredRecord>>>) -> RecordStream {
    chunks
        .map_ok(|chunk| stream::iter(chunk.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
}

/// Stream every record matching `query` from `target`.
pub fn read<B>(backend: Arc<B>, target: Target, query: ReadQuery, options: ReadOptions) -> RecordStream
where
    B: DataBackend + ?Sized + 'static,
{
    let profile = backend.profile().clone();
    let prefetch = options.prefetch.unwrap_or(profile.prefetch);
    let mut reader = ChunkReader {
        backend,
        target,
        query,
        chunk_size: options.chunk_size.unwrap_or(profile.read_chunk_size).max(1),
        remaining: options.limit,
        timeout: profile.timeout,
        done: false,
    };

    if prefetch == 0 {
        let chunks = stream::unfold(reader, |mut reader| async move {
            match reader.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), reader)),
                Ok(None) => None,
                Err(e) => {
                    reader.done = true;
                    Some((Err(e), reader))
                }
            }
        });
        return flatten(chunks.boxed());
    }

    let (tx, rx) = mpsc::channel(prefetch);
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = tx.closed() => break,
                next = reader.next_chunk() => next,
            };
            match next {
                Ok(Some(chunk)) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
        debug!(target = %reader.target, "prefetch producer stopped");
    });
    flatten(ReceiverStream::new(rx).boxed())
}

// ─────────────────────────────────────────────────────────────────────────────
// Writes
// ─────────────────────────────────────────────────────────────────────────────

type BatchHandle = JoinHandle<(Vec<IdentityKey>, Result<BatchOutcome>)>;

#[derive(Default)]
struct WriteTally {
    written: usize,
    skipped: usize,
    failure: Option<StoreError>,
    unpersisted: Vec<IdentityKey>,
}

impl WriteTally {
    fn settle(&mut self, keys: Vec<IdentityKey>, result: Result<BatchOutcome>) {
        match result {
            Ok(outcome) => {
                self.written += outcome.written;
                self.skipped += outcome.skipped;
            }
            Err(StoreError::BatchRejected { keys: rejected, reason }) => {
                // Everything else in the batch went through.
                self.written += keys.len().saturating_sub(rejected.len());
                self.unpersisted.extend(rejected.iter().copied());
                self.fail(StoreError::BatchRejected {
                    keys: rejected,
                    reason,
                });
            }
            Err(e) => {
                self.unpersisted.extend(keys);
                self.fail(e);
            }
        }
    }

    fn fail(&mut self, e: StoreError) {
        if self.failure.is_none() {
            self.failure = Some(e);
        }
    }
}

/// Write `records` to `target` in batches.
///
/// Every statement must already carry its `id` and `timestamp`.
pub async fn write<B, I>(
    backend: Arc<B>,
    target: &Target,
    records: I,
    options: WriteOptions,
) -> Result<WriteReport>
where
    B: DataBackend + ?Sized + 'static,
    I: IntoIterator<Item = Statement>,
    I::IntoIter: Send,
{
    let name = backend.name();
    let writable = backend
        .as_writable()
        .ok_or_else(|| StoreError::NotWritable(name.to_string()))?;
    if !writable.supports(options.on_conflict) {
        return Err(StoreError::UnsupportedConflictPolicy {
            backend: name.to_string(),
            policy: options.on_conflict,
        });
    }

    let profile = backend.profile().clone();
    let chunk_size = options.chunk_size.unwrap_or(profile.write_chunk_size).max(1);
    let concurrency = if profile.ordered_writes {
        1
    } else {
        options.concurrency.max(1)
    };

    let mut records = records.into_iter();
    let mut in_flight: FuturesUnordered<BatchHandle> = FuturesUnordered::new();
    let mut tally = WriteTally::default();
    let mut submitted = 0;

    loop {
        if tally.failure.is_some() {
            break;
        }
        let batch: Vec<Statement> = records.by_ref().take(chunk_size).collect();
        if batch.is_empty() {
            break;
        }
        let keys = match batch
            .iter()
            .map(|s| s.require_id())
            .collect::<std::result::Result<Vec<_>, _>>()
        {
            Ok(keys) => keys,
            Err(e) => {
                tally.unpersisted.extend(batch.iter().filter_map(Statement::id));
                tally.fail(e.into());
                break;
            }
        };

        while in_flight.len() >= concurrency {
            if let Some(joined) = in_flight.next().await {
                settle_joined(&mut tally, joined);
            }
        }
        if tally.failure.is_some() {
            tally.unpersisted.extend(keys);
            break;
        }

        submitted += batch.len();
        debug!(backend = name, target = %target, size = batch.len(), "submitting batch");
        in_flight.push(spawn_batch(
            Arc::clone(&backend),
            target.clone(),
            batch,
            keys,
            options.on_conflict,
            profile.timeout,
        ));
    }

    while let Some(joined) = in_flight.next().await {
        settle_joined(&mut tally, joined);
    }

    match tally.failure {
        None => Ok(WriteReport {
            target: target.clone(),
            submitted,
            written: tally.written,
            skipped: tally.skipped,
        }),
        Some(source) => {
            tally
                .unpersisted
                .extend(records.filter_map(|statement| statement.id()));
            warn!(
                backend = name,
                target = %target,
                persisted = tally.written,
                unpersisted = tally.unpersisted.len(),
                error = %source,
                "write aborted"
            );
            Err(StoreError::WriteAborted {
                persisted: tally.written,
                unpersisted: tally.unpersisted,
                source: Box::new(source),
            })
        }
    }
}

fn settle_joined(
    tally: &mut WriteTally,
    joined: std::result::Result<(Vec<IdentityKey>, Result<BatchOutcome>), tokio::task::JoinError>,
) {
    match joined {
        Ok((keys, result)) => tally.settle(keys, result),
        Err(e) => tally.fail(StoreError::Internal(format!("write batch task failed: {e}"))),
    }
}

fn spawn_batch<B>(
    backend: Arc<B>,
    target: Target,
    batch: Vec<Statement>,
    keys: Vec<IdentityKey>,
    policy: OnConflict,
    timeout: Duration,
) -> BatchHandle
where
    B: DataBackend + ?Sized + 'static,
{
    tokio::spawn(async move {
        let result = match backend.as_writable() {
            Some(writable) => {
                match tokio::time::timeout(timeout, writable.write_batch(&target, &batch, policy))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Timeout {
                        backend: backend.name().to_string(),
                        operation: "write",
                        after: timeout,
                    }),
                }
            }
            None => Err(StoreError::NotWritable(backend.name().to_string())),
        };
        (keys, result)
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Extension trait
// ─────────────────────────────────────────────────────────────────────────────

/// Pipeline operations on a shared backend.
#[async_trait]
pub trait BackendExt {
    /// Stream every record matching `query`.
    fn read(&self, target: &Target, query: ReadQuery, options: ReadOptions) -> RecordStream;

    /// Collect a read into memory.
    async fn read_all(
        &self,
        target: &Target,
        query: ReadQuery,
        options: ReadOptions,
    ) -> Result<Vec<StoredRecord>>;

    /// Write records in batches.
    async fn write(
        &self,
        target: &Target,
        records: Vec<Statement>,
        options: WriteOptions,
    ) -> Result<WriteReport>;
}

#[async_trait]
impl<B> BackendExt for Arc<B>
where
    B: DataBackend + ?Sized + 'static,
{
    fn read(&self, target: &Target, query: ReadQuery, options: ReadOptions) -> RecordStream {
        read(Arc::clone(self), target.clone(), query, options)
    }

    async fn read_all(
        &self,
        target: &Target,
        query: ReadQuery,
        options: ReadOptions,
    ) -> Result<Vec<StoredRecord>> {
        read(Arc::clone(self), target.clone(), query, options)
            .try_collect()
            .await
    }

    async fn write(
        &self,
        target: &Target,
        records: Vec<Statement>,
        options: WriteOptions,
    ) -> Result<WriteReport> {
        write(Arc::clone(self), target, records, options).await
    }
}
