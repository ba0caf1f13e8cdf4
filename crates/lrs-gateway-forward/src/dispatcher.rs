//! The forwarding dispatcher.
//!
//! After a write is persisted the accepted statements are handed to
//! [`ForwardingDispatcher::dispatch`], which spawns one delivery task per
//! active target. Targets are independent: each has its own timeout and
//! retry budget, and one failing target never affects another or the
//! write that triggered the dispatch.
//!
//! A target that exhausts its retries yields a [`PartialForwardingFailure`].
//! Failures are logged and kept in a bounded log ([`recent_failures`]); they
//! are never returned to the writer as errors.
//!
//! [`recent_failures`]: ForwardingDispatcher::recent_failures

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use lrs_gateway_core::{IdentityKey, Statement};

use crate::error::ForwardError;
use crate::target::ForwardingTarget;
use crate::transport::ForwardTransport;

/// Retry pacing and failure-log size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Delay before the first retry; doubles with every further retry.
    pub backoff_base_ms: u64,
    /// Upper bound on a single delay, before jitter.
    pub backoff_max_ms: u64,
    /// Failures kept for [`ForwardingDispatcher::recent_failures`].
    pub failure_log_capacity: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
            failure_log_capacity: 100,
        }
    }
}

impl DispatchSettings {
    /// Delay before retry number `retry` (1-based), with up to 50% jitter.
    fn backoff(&self, retry: u32) -> Duration {
        let exp = self
            .backoff_base_ms
            .saturating_mul(1u64 << retry.saturating_sub(1).min(32));
        let delay = exp.min(self.backoff_max_ms);
        let jitter = if delay > 0 {
            rand::thread_rng().gen_range(0..=delay / 2)
        } else {
            0
        };
        Duration::from_millis(delay + jitter)
    }
}

/// A target that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartialForwardingFailure {
    pub url: String,
    pub attempts: u32,
    /// The last attempt's error.
    pub error: String,
    /// Statements that did not reach the target.
    pub keys: Vec<IdentityKey>,
    pub failed_at: DateTime<Utc>,
}

/// Result of delivering one dispatch to one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    Delivered { url: String, attempts: u32 },
    Failed(PartialForwardingFailure),
}

/// Per-target results of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    pub failed: Vec<PartialForwardingFailure>,
}

impl DispatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Delivery tasks of one dispatch.
///
/// Dropping the handle detaches the tasks; they still run to completion.
#[must_use = "dropping the handle detaches delivery; call wait() to observe it"]
#[derive(Debug, Default)]
pub struct DispatchHandle {
    tasks: Vec<(String, JoinHandle<TargetOutcome>)>,
}

impl DispatchHandle {
    /// Targets this dispatch went to.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every target to finish.
    pub async fn wait(self) -> DispatchReport {
        let mut report = DispatchReport::default();
        for (url, task) in self.tasks {
            match task.await {
                Ok(TargetOutcome::Delivered { url, .. }) => report.delivered.push(url),
                Ok(TargetOutcome::Failed(failure)) => report.failed.push(failure),
                Err(e) => report.failed.push(PartialForwardingFailure {
                    url,
                    attempts: 0,
                    error: ForwardError::Internal(e.to_string()).to_string(),
                    keys: Vec::new(),
                    failed_at: Utc::now(),
                }),
            }
        }
        report
    }
}

type FailureLog = Arc<Mutex<VecDeque<PartialForwardingFailure>>>;

/// Replicates accepted statements to downstream LRS targets.
pub struct ForwardingDispatcher {
    targets: Arc<[ForwardingTarget]>,
    transport: Arc<dyn ForwardTransport>,
    settings: DispatchSettings,
    failures: FailureLog,
}

impl ForwardingDispatcher {
    /// Inactive targets are dropped here.
    pub fn new(
        targets: Vec<ForwardingTarget>,
        transport: Arc<dyn ForwardTransport>,
        settings: DispatchSettings,
    ) -> Self {
        let targets: Vec<ForwardingTarget> = targets.into_iter().filter(|t| t.is_active).collect();
        if targets.is_empty() {
            debug!("no active forwarding target; forwarding is disabled");
        }
        Self {
            targets: targets.into(),
            transport,
            settings,
            failures: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// A dispatcher with no targets.
    pub fn disabled(transport: Arc<dyn ForwardTransport>) -> Self {
        Self::new(Vec::new(), transport, DispatchSettings::default())
    }

    pub fn targets(&self) -> &[ForwardingTarget] {
        &self.targets
    }

    pub fn is_enabled(&self) -> bool {
        !self.targets.is_empty()
    }

    /// Most recent failures, oldest first.
    pub fn recent_failures(&self) -> Vec<PartialForwardingFailure> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Start delivering `statements` to every active target.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn dispatch(&self, statements: Vec<Statement>) -> DispatchHandle {
        if statements.is_empty() || self.targets.is_empty() {
            return DispatchHandle::default();
        }
        let statements: Arc<[Statement]> = statements.into();
        let tasks = self
            .targets
            .iter()
            .map(|target| {
                let delivery = Delivery {
                    target: target.clone(),
                    transport: Arc::clone(&self.transport),
                    settings: self.settings.clone(),
                    failures: Arc::clone(&self.failures),
                    statements: Arc::clone(&statements),
                };
                (target.url.clone(), tokio::spawn(delivery.run()))
            })
            .collect();
        DispatchHandle { tasks }
    }
}

impl std::fmt::Debug for ForwardingDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingDispatcher")
            .field("targets", &self.targets)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// One dispatch to one target.
struct Delivery {
    target: ForwardingTarget,
    transport: Arc<dyn ForwardTransport>,
    settings: DispatchSettings,
    failures: FailureLog,
    statements: Arc<[Statement]>,
}

impl Delivery {
    async fn run(self) -> TargetOutcome {
        let url = self.target.url.clone();
        let mut attempts = 0u32;
        loop {
            attempts = attempts.saturating_add(1);
            let attempt = self.transport.deliver(&self.target, &self.statements);
            let result = match tokio::time::timeout(self.target.timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(ForwardError::Timeout {
                    url: url.clone(),
                    after: self.target.timeout,
                }),
            };

            let err = match result {
                Ok(()) => {
                    debug!(%url, attempts, count = self.statements.len(), "forwarded statements");
                    return TargetOutcome::Delivered { url, attempts };
                }
                Err(err) => err,
            };

            let retries_used = attempts - 1;
            if err.is_retryable() && retries_used < self.target.max_retries {
                let delay = self.settings.backoff(attempts);
                warn!(%url, attempts, ?delay, error = %err, "forwarding attempt failed; retrying");
                tokio::time::sleep(delay).await;
                continue;
            }

            return TargetOutcome::Failed(self.record_failure(attempts, err));
        }
    }

    fn record_failure(&self, attempts: u32, err: ForwardError) -> PartialForwardingFailure {
        let failure = PartialForwardingFailure {
            url: self.target.url.clone(),
            attempts,
            error: err.to_string(),
            keys: self.statements.iter().filter_map(Statement::id).collect(),
            failed_at: Utc::now(),
        };
        error!(
            url = %failure.url,
            attempts,
            statements = failure.keys.len(),
            error = %failure.error,
            "failed to forward statements"
        );

        let capacity = self.settings.failure_log_capacity;
        if capacity > 0 {
            let mut log = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            while log.len() >= capacity {
                log.pop_front();
            }
            log.push_back(failure.clone());
        }
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let settings = DispatchSettings {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            failure_log_capacity: 10,
        };
        for _ in 0..20 {
            let first = settings.backoff(1);
            assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
            let third = settings.backoff(3);
            assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(600));
            let capped = settings.backoff(30);
            assert!(capped >= Duration::from_millis(1_000) && capped <= Duration::from_millis(1_500));
        }
    }

    #[test]
    fn test_zero_base_has_no_delay() {
        let settings = DispatchSettings {
            backoff_base_ms: 0,
            ..DispatchSettings::default()
        };
        assert_eq!(settings.backoff(5), Duration::ZERO);
    }

    #[test]
    fn test_backoff_at_last_retry_is_capped() {
        let settings = DispatchSettings::default();
        let delay = settings.backoff(u32::MAX);
        assert!(delay <= Duration::from_millis(settings.backoff_max_ms * 3 / 2));
    }
}
