//! Per-adapter settings.
//!
//! Every section has a `Default` and every field a serde default, so a
//! configuration file only needs to mention what it changes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendProfile;

/// Settings for every built-in adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub memory: MemorySettings,
    pub sqlite: SqliteSettings,
    pub fs: FsSettings,
    pub es: EsSettings,
    pub clickhouse: ClickHouseSettings,
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub read_chunk_size: usize,
    pub write_chunk_size: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            read_chunk_size: 500,
            write_chunk_size: 500,
        }
    }
}

impl MemorySettings {
    pub fn profile(&self) -> BackendProfile {
        BackendProfile {
            read_chunk_size: self.read_chunk_size,
            write_chunk_size: self.write_chunk_size,
            prefetch: 0,
            ordered_writes: false,
            native_sort: true,
            timeout: Duration::from_secs(5),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteSettings {
    /// Database file. `None` opens a private in-memory database.
    pub path: Option<PathBuf>,
    pub read_chunk_size: usize,
    pub write_chunk_size: usize,
    pub timeout_secs: u64,
}

impl Default for SqliteSettings {
    fn default() -> Self {
        Self {
            path: None,
            read_chunk_size: 500,
            write_chunk_size: 500,
            timeout_secs: 30,
        }
    }
}

impl SqliteSettings {
    pub fn profile(&self) -> BackendProfile {
        BackendProfile {
            read_chunk_size: self.read_chunk_size,
            write_chunk_size: self.write_chunk_size,
            prefetch: 0,
            ordered_writes: true,
            native_sort: true,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Filesystem
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsSettings {
    /// Directory holding one `<target>.jsonl` file per target.
    pub root: PathBuf,
    pub read_chunk_size: usize,
    pub write_chunk_size: usize,
    pub timeout_secs: u64,
}

impl Default for FsSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./lrs-data"),
            read_chunk_size: 4096,
            write_chunk_size: 4096,
            timeout_secs: 30,
        }
    }
}

impl FsSettings {
    pub fn profile(&self) -> BackendProfile {
        BackendProfile {
            read_chunk_size: self.read_chunk_size,
            write_chunk_size: self.write_chunk_size,
            prefetch: 0,
            ordered_writes: true,
            native_sort: false,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Elasticsearch
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EsSettings {
    pub hosts: String,
    /// Value of the `refresh` parameter on bulk writes.
    pub refresh: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// How long a point in time stays open between chunks of one read.
    pub point_in_time_keep_alive: String,
    pub read_chunk_size: usize,
    pub write_chunk_size: usize,
    pub prefetch: usize,
    pub timeout_secs: u64,
}

impl Default for EsSettings {
    fn default() -> Self {
        Self {
            hosts: "http://localhost:9200".to_string(),
            refresh: None,
            username: None,
            password: None,
            point_in_time_keep_alive: "1m".to_string(),
            read_chunk_size: 500,
            write_chunk_size: 500,
            prefetch: 2,
            timeout_secs: 10,
        }
    }
}

impl EsSettings {
    pub fn profile(&self) -> BackendProfile {
        BackendProfile {
            read_chunk_size: self.read_chunk_size,
            write_chunk_size: self.write_chunk_size,
            prefetch: self.prefetch,
            ordered_writes: false,
            native_sort: true,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ClickHouse
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickHouseSettings {
    pub url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub read_chunk_size: usize,
    pub write_chunk_size: usize,
    /// Maximum ids per `read_by_ids` request.
    pub ids_chunk_size: usize,
    pub prefetch: usize,
    pub timeout_secs: u64,
}

impl Default for ClickHouseSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "xapi".to_string(),
            username: None,
            password: None,
            read_chunk_size: 500,
            write_chunk_size: 500,
            ids_chunk_size: 10_000,
            prefetch: 2,
            timeout_secs: 10,
        }
    }
}

impl ClickHouseSettings {
    pub fn profile(&self) -> BackendProfile {
        BackendProfile {
            read_chunk_size: self.read_chunk_size,
            write_chunk_size: self.write_chunk_size,
            prefetch: self.prefetch,
            ordered_writes: false,
            native_sort: true,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}
