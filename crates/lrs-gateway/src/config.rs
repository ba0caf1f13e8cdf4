//! Gateway configuration.
//!
//! A typed model deserialized from TOML. Every field has a default, so an
//! empty document is a valid configuration (in-memory SQLite, no
//! forwarding):
//!
//! ```toml
//! backend = "sqlite"
//! default_target = "statements"
//! restrict_by_authority = true
//!
//! [read]
//! max_limit = 100
//!
//! [write]
//! concurrency = 4
//! on_conflict = "fail"
//!
//! [backends.sqlite]
//! path = "lrs.db"
//!
//! [[forwarding]]
//! is_active = true
//! url = "https://downstream.example.com/xAPI/statements"
//! basic_username = "gateway"
//! basic_password = "secret"
//! max_retries = 3
//! timeout = 5.0
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use lrs_gateway_core::{Target, DEFAULT_TARGET};
use lrs_gateway_forward::{DispatchSettings, RawForwardingEntry};
use lrs_gateway_store::{BackendSettings, OnConflict, ReadOptions, WriteOptions};

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Registry name of the data backend.
    pub backend: String,
    pub default_target: String,
    /// Confine reads to the caller's own authority unless it may read all
    /// statements.
    pub restrict_by_authority: bool,
    /// Enforce `statements/write` and `statements/read[/mine]` scopes.
    pub restrict_by_scopes: bool,
    pub read: ReadSettings,
    pub write: WriteSettings,
    pub backends: BackendSettings,
    pub dispatch: DispatchSettings,
    /// Downstream LRS endpoints, in order.
    pub forwarding: Vec<RawForwardingEntry>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            default_target: DEFAULT_TARGET.to_string(),
            restrict_by_authority: false,
            restrict_by_scopes: false,
            read: ReadSettings::default(),
            write: WriteSettings::default(),
            backends: BackendSettings::default(),
            dispatch: DispatchSettings::default(),
            forwarding: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Configuration(format!("reading {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<()> {
        self.target()?;
        if self.read.max_limit == 0 {
            return Err(GatewayError::Configuration("read.max_limit must be positive".into()));
        }
        if self.write.concurrency == 0 {
            return Err(GatewayError::Configuration(
                "write.concurrency must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn target(&self) -> Result<Target> {
        Ok(Target::new(self.default_target.as_str())?)
    }
}

/// Read pagination and pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadSettings {
    /// Page size for `limit = 0` and the ceiling for larger limits.
    pub max_limit: usize,
    /// Overrides the backend's read chunk size.
    pub chunk_size: Option<usize>,
    /// Overrides the backend's prefetch depth.
    pub prefetch: Option<usize>,
}

impl Default for ReadSettings {
    fn default() -> Self {
        Self {
            max_limit: 100,
            chunk_size: None,
            prefetch: None,
        }
    }
}

impl ReadSettings {
    /// Effective page size for a requested limit.
    pub fn page_size(&self, requested: usize) -> usize {
        if requested == 0 {
            self.max_limit
        } else {
            requested.min(self.max_limit)
        }
    }

    pub(crate) fn options(&self, limit: usize) -> ReadOptions {
        ReadOptions {
            chunk_size: self.chunk_size,
            prefetch: self.prefetch,
            limit: Some(limit),
        }
    }
}

/// Write pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteSettings {
    /// Overrides the backend's write chunk size.
    pub chunk_size: Option<usize>,
    pub concurrency: usize,
    pub on_conflict: OnConflict,
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self {
            chunk_size: None,
            concurrency: 1,
            on_conflict: OnConflict::Fail,
        }
    }
}

impl WriteSettings {
    pub(crate) fn options(&self) -> WriteOptions {
        WriteOptions {
            chunk_size: self.chunk_size,
            concurrency: self.concurrency,
            on_conflict: self.on_conflict,
        }
    }
}
