//! Forwarding targets and their configuration entries.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Upper bound on `max_retries`; larger configured values are clamped.
pub const MAX_RETRIES: u32 = 100;

/// One forwarding entry as it appears in configuration.
///
/// Every field is required. An entry missing any of them is dropped by
/// [`ForwardingTarget::from_entries`] without affecting the others.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawForwardingEntry {
    pub is_active: Option<bool>,
    pub url: Option<String>,
    pub basic_username: Option<String>,
    pub basic_password: Option<String>,
    pub max_retries: Option<u32>,
    /// Seconds.
    pub timeout: Option<f64>,
}

impl RawForwardingEntry {
    fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.is_active.is_none() {
            missing.push("is_active");
        }
        if self.url.as_deref().map_or(true, str::is_empty) {
            missing.push("url");
        }
        if self.basic_username.is_none() {
            missing.push("basic_username");
        }
        if self.basic_password.is_none() {
            missing.push("basic_password");
        }
        if self.max_retries.is_none() {
            missing.push("max_retries");
        }
        if !self
            .timeout
            .is_some_and(|t| t > 0.0 && Duration::try_from_secs_f64(t).is_ok())
        {
            missing.push("timeout");
        }
        missing
    }
}

/// A validated downstream LRS. Read once at start, never mutated.
#[derive(Clone, PartialEq, Eq)]
pub struct ForwardingTarget {
    pub url: String,
    pub basic_username: String,
    pub basic_password: String,
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub is_active: bool,
}

impl ForwardingTarget {
    pub fn new(url: impl Into<String>, max_retries: u32, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            basic_username: String::new(),
            basic_password: String::new(),
            max_retries,
            timeout,
            is_active: true,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_username = username.into();
        self.basic_password = password.into();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Parse configuration entries, keeping their order.
    ///
    /// Incomplete entries are logged and excluded individually. Inactive
    /// entries are kept; the dispatcher skips them.
    pub fn from_entries(entries: impl IntoIterator<Item = RawForwardingEntry>) -> Vec<Self> {
        let mut targets = Vec::new();
        for (index, entry) in entries.into_iter().enumerate() {
            let missing = entry.missing_fields();
            if !missing.is_empty() {
                warn!(index, ?missing, "ignoring incomplete forwarding entry");
                continue;
            }
            let (
                Some(is_active),
                Some(url),
                Some(basic_username),
                Some(basic_password),
                Some(max_retries),
                Some(timeout),
            ) = (
                entry.is_active,
                entry.url,
                entry.basic_username,
                entry.basic_password,
                entry.max_retries,
                entry.timeout,
            )
            else {
                continue;
            };
            if !is_active {
                info!(%url, "forwarding entry is not active");
            }
            if max_retries > MAX_RETRIES {
                warn!(%url, max_retries, "clamping forwarding retries to {MAX_RETRIES}");
            }
            targets.push(ForwardingTarget {
                url,
                basic_username,
                basic_password,
                max_retries: max_retries.min(MAX_RETRIES),
                timeout: Duration::try_from_secs_f64(timeout).unwrap_or(Duration::MAX),
                is_active,
            });
        }
        targets
    }
}

// Keeps the password out of logs.
impl std::fmt::Debug for ForwardingTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingTarget")
            .field("url", &self.url)
            .field("basic_username", &self.basic_username)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("is_active", &self.is_active)
            .finish_non_exhaustive()
    }
}
