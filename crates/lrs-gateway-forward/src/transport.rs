//! Delivery of statement batches to one forwarding target.
//!
//! The dispatcher owns retries and timeouts; a transport makes a single
//! attempt and reports how it went.

use async_trait::async_trait;
use reqwest::Client;

use lrs_gateway_core::Statement;

use crate::error::{ForwardError, Result};
use crate::target::ForwardingTarget;

/// Version header every xAPI request carries.
pub const XAPI_VERSION_HEADER: &str = "X-Experience-API-Version";
pub const XAPI_VERSION: &str = "1.0.3";

/// Makes one delivery attempt to a target.
#[async_trait]
pub trait ForwardTransport: Send + Sync {
    async fn deliver(&self, target: &ForwardingTarget, statements: &[Statement]) -> Result<()>;
}

/// POSTs the statement list as JSON to the target URL.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ForwardTransport for HttpTransport {
    async fn deliver(&self, target: &ForwardingTarget, statements: &[Statement]) -> Result<()> {
        let response = self
            .client
            .post(&target.url)
            .basic_auth(&target.basic_username, Some(&target.basic_password))
            .header(XAPI_VERSION_HEADER, XAPI_VERSION)
            .timeout(target.timeout)
            .json(statements)
            .send()
            .await
            .map_err(|e| ForwardError::from_http(&target.url, target.timeout, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ForwardError::Status {
            url: target.url.clone(),
            status: status.as_u16(),
            body,
        })
    }
}

/// An in-process transport for tests.
///
/// Records every successful delivery per URL and can be told to fail
/// selected URLs.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Mutex, PoisonError};

    /// How a URL configured to fail fails.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Failure {
        /// HTTP status code.
        Status(u16),
        Unreachable,
        /// Never answers; the dispatcher timeout fires.
        Hang,
    }

    #[derive(Default)]
    struct State {
        delivered: HashMap<String, Vec<Statement>>,
        attempts: HashMap<String, usize>,
        /// URL to failure and the number of attempts it still fails (None: always).
        failing: HashMap<String, (Failure, Option<usize>)>,
    }

    #[derive(Default)]
    pub struct MemoryTransport {
        state: Mutex<State>,
    }

    impl MemoryTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every attempt against `url` fail.
        pub fn fail(&self, url: impl Into<String>, failure: Failure) {
            self.lock().failing.insert(url.into(), (failure, None));
        }

        /// Make the next `times` attempts against `url` fail.
        pub fn fail_times(&self, url: impl Into<String>, failure: Failure, times: usize) {
            self.lock().failing.insert(url.into(), (failure, Some(times)));
        }

        /// Statements delivered to `url`, in delivery order.
        pub fn delivered(&self, url: &str) -> Vec<Statement> {
            self.lock().delivered.get(url).cloned().unwrap_or_default()
        }

        /// Attempts made against `url`, failed ones included.
        pub fn attempts(&self, url: &str) -> usize {
            self.lock().attempts.get(url).copied().unwrap_or(0)
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Record the attempt and return the failure to simulate, if any.
        fn attempt(&self, url: &str) -> Option<Failure> {
            let mut state = self.lock();
            *state.attempts.entry(url.to_string()).or_default() += 1;
            let failure = match state.failing.get_mut(url) {
                Some((failure, None)) => Some(*failure),
                Some((failure, Some(remaining))) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*failure)
                }
                _ => None,
            };
            failure
        }
    }

    #[async_trait]
    impl ForwardTransport for MemoryTransport {
        async fn deliver(&self, target: &ForwardingTarget, statements: &[Statement]) -> Result<()> {
            match self.attempt(&target.url) {
                None => {
                    self.lock()
                        .delivered
                        .entry(target.url.clone())
                        .or_default()
                        .extend(statements.iter().cloned());
                    Ok(())
                }
                Some(Failure::Status(status)) => Err(ForwardError::Status {
                    url: target.url.clone(),
                    status,
                    body: String::new(),
                }),
                Some(Failure::Unreachable) => Err(ForwardError::Connect {
                    url: target.url.clone(),
                    reason: "connection refused".to_string(),
                }),
                Some(Failure::Hang) => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }
    }
}
