//! A backend wrapper with call counters and failure injection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use lrs_gateway_core::{IdentityKey, ReadQuery, Statement, Target};
use lrs_gateway_store::{
    BackendProfile, BackendStatus, BatchOutcome, DataBackend, Listable, MemoryBackend,
    OnConflict, Result, StoreError, StoredRecord, TargetStream, Writable,
};

#[derive(Debug, Default)]
struct Faults {
    down: bool,
    passing_reads: usize,
    failing_reads: usize,
    failing_writes: usize,
    read_delay: Option<Duration>,
}

/// Delegates to an inner backend, counting calls and failing on demand.
///
/// Reports the inner backend's name and profile, so translators and the
/// pipeline treat it exactly like the backend it wraps.
pub struct FaultyBackend {
    inner: Arc<dyn DataBackend>,
    faults: Mutex<Faults>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl FaultyBackend {
    pub fn new(inner: Arc<dyn DataBackend>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Faults::default()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Wrap a fresh in-memory backend.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn inner(&self) -> &Arc<dyn DataBackend> {
        &self.inner
    }

    /// Fail every call until cleared.
    pub fn set_down(&self, down: bool) {
        self.faults().down = down;
    }

    /// Fail the next `n` read calls.
    pub fn fail_reads(&self, n: usize) {
        self.fail_reads_after(0, n);
    }

    /// Let `passing` read calls through, then fail the `n` after them.
    pub fn fail_reads_after(&self, passing: usize, n: usize) {
        let mut faults = self.faults();
        faults.passing_reads = passing;
        faults.failing_reads = n;
    }

    /// Fail the next `n` batch writes.
    pub fn fail_writes(&self, n: usize) {
        self.faults().failing_writes = n;
    }

    /// Delay every read call.
    pub fn delay_reads(&self, delay: Duration) {
        self.faults().read_delay = Some(delay);
    }

    /// Read calls made so far, including failed ones.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Batch writes made so far, including failed ones.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unavailable(&self, what: &str) -> StoreError {
        StoreError::Unavailable {
            backend: self.inner.name().to_string(),
            reason: format!("injected {what} failure"),
        }
    }

    async fn before_read(&self) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay = {
            let mut faults = self.faults();
            if faults.down {
                return Err(self.unavailable("read"));
            }
            if faults.passing_reads > 0 {
                faults.passing_reads -= 1;
            } else if faults.failing_reads > 0 {
                faults.failing_reads -= 1;
                return Err(self.unavailable("read"));
            }
            faults.read_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn before_write(&self) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut faults = self.faults();
        if faults.down {
            return Err(self.unavailable("write"));
        }
        if faults.failing_writes > 0 {
            faults.failing_writes -= 1;
            return Err(self.unavailable("write"));
        }
        Ok(())
    }
}

#[async_trait]
impl DataBackend for FaultyBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn profile(&self) -> &BackendProfile {
        self.inner.profile()
    }

    async fn status(&self, target: &Target) -> BackendStatus {
        if self.faults().down {
            return BackendStatus::Unreachable;
        }
        self.inner.status(target).await
    }

    async fn read_chunk(
        &self,
        target: &Target,
        query: &ReadQuery,
        size: usize,
    ) -> Result<Vec<StoredRecord>> {
        self.before_read().await?;
        self.inner.read_chunk(target, query, size).await
    }

    async fn read_by_ids(&self, target: &Target, ids: &[IdentityKey]) -> Result<Vec<StoredRecord>> {
        self.before_read().await?;
        self.inner.read_by_ids(target, ids).await
    }

    fn as_writable(&self) -> Option<&dyn Writable> {
        self.inner.as_writable().map(|_| self as &dyn Writable)
    }

    fn as_listable(&self) -> Option<&dyn Listable> {
        self.inner.as_listable().map(|_| self as &dyn Listable)
    }
}

#[async_trait]
impl Writable for FaultyBackend {
    fn supports(&self, policy: OnConflict) -> bool {
        self.inner
            .as_writable()
            .map_or(false, |writable| writable.supports(policy))
    }

    async fn write_batch(
        &self,
        target: &Target,
        batch: &[Statement],
        policy: OnConflict,
    ) -> Result<BatchOutcome> {
        self.before_write()?;
        let writable = self
            .inner
            .as_writable()
            .ok_or_else(|| StoreError::NotWritable(self.inner.name().to_string()))?;
        writable.write_batch(target, batch, policy).await
    }
}

#[async_trait]
impl Listable for FaultyBackend {
    async fn list(&self, prefix: Option<&str>) -> Result<TargetStream> {
        if self.faults().down {
            return Err(self.unavailable("list"));
        }
        let listable = self
            .inner
            .as_listable()
            .ok_or_else(|| StoreError::NotListable(self.inner.name().to_string()))?;
        listable.list(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{mbox, StatementFactory};
    use lrs_gateway_core::Authority;

    #[tokio::test]
    async fn test_injected_write_failures_are_consumed() {
        let backend = FaultyBackend::memory();
        let factory = StatementFactory::new();
        let target = Target::default();
        let authority = Authority::new(mbox("client"));
        let batch = vec![factory.stamped(factory.experienced(0), &authority)];

        backend.fail_writes(1);
        assert!(backend
            .write_batch(&target, &batch, OnConflict::Fail)
            .await
            .is_err());
        let outcome = backend
            .write_batch(&target, &batch, OnConflict::Fail)
            .await
            .unwrap();
        assert_eq!(outcome.written, 1);
        assert_eq!(backend.writes(), 2);
    }

    #[tokio::test]
    async fn test_down_backend_reports_unreachable() {
        let backend = FaultyBackend::memory();
        let target = Target::default();
        backend.set_down(true);
        assert_eq!(backend.status(&target).await, BackendStatus::Unreachable);
        assert!(backend.read_by_ids(&target, &[]).await.is_err());
        backend.set_down(false);
        assert_eq!(backend.status(&target).await, BackendStatus::Ok);
    }

    #[tokio::test]
    async fn test_read_failures_can_be_deferred() {
        let backend = FaultyBackend::memory();
        let target = Target::default();
        backend.fail_reads_after(1, 1);
        assert!(backend.read_by_ids(&target, &[]).await.is_ok());
        assert!(backend.read_by_ids(&target, &[]).await.is_err());
        assert!(backend.read_by_ids(&target, &[]).await.is_ok());
        assert_eq!(backend.reads(), 3);
    }

    #[test]
    fn test_capabilities_follow_inner() {
        let backend = FaultyBackend::memory();
        assert!(backend.capabilities().writable);
        assert!(backend.capabilities().listable);
        assert_eq!(backend.name(), "memory");
    }
}
