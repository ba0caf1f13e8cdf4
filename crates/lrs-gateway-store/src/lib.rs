//! # LRS Gateway Store
//!
//! Data backends for the LRS gateway. Every engine sits behind the
//! capability-typed [`DataBackend`] trait; the canonical [`ReadQuery`] is
//! lowered into each engine's native form by a translator, and records move
//! through a chunked streaming [`pipeline`].
//!
//! ## Key Types
//!
//! - [`DataBackend`] - Base trait: status, chunked reads, id lookups
//! - [`Writable`] / [`Listable`] - Optional capabilities
//! - [`BackendExt`] - Lazy record streams and batched writes
//! - [`BackendRegistry`] - Named adapters, constructed on first use
//! - [`TranslatorRegistry`] - Canonical query to native query, per engine
//!
//! ## Adapters
//!
//! | Name | Engine | Conflict policies |
//! |---|---|---|
//! | `memory` | in-process index | all |
//! | `sqlite` | rusqlite | all |
//! | `fs` | JSON lines, one file per target | fail, ignore |
//! | `es` | Elasticsearch over HTTP | all |
//! | `clickhouse` | ClickHouse over HTTP | overwrite |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lrs_gateway_store::{BackendExt, BackendRegistry, ReadOptions};
//! use lrs_gateway_core::{ReadQuery, Target};
//!
//! async fn example() {
//!     let registry = BackendRegistry::default();
//!     let backend = registry.resolve("sqlite").unwrap();
//!
//!     let records = backend
//!         .read_all(&Target::default(), ReadQuery::default(), ReadOptions::limit(10))
//!         .await
//!         .unwrap();
//!     println!("{} records", records.len());
//! }
//! ```
//!
//! [`ReadQuery`]: lrs_gateway_core::ReadQuery

pub mod backend;
pub mod clickhouse;
pub mod error;
pub mod es;
pub mod fs;
pub mod memory;
pub mod migration;
pub mod pipeline;
pub mod registry;
pub mod settings;
pub mod sqlite;
pub mod translate;

pub use backend::{
    BackendProfile, BackendStatus, BatchOutcome, Capabilities, DataBackend, Listable,
    OnConflict, StoredRecord, TargetStream, Writable,
};
pub use clickhouse::ClickHouseBackend;
pub use error::{Result, StoreError};
pub use es::EsBackend;
pub use fs::FsBackend;
pub use memory::MemoryBackend;
pub use pipeline::{BackendExt, ReadOptions, RecordStream, WriteOptions, WriteReport};
pub use registry::{BackendFactory, BackendRegistry};
pub use settings::{
    BackendSettings, ClickHouseSettings, EsSettings, FsSettings, MemorySettings, SqliteSettings,
};
pub use sqlite::SqliteBackend;
pub use translate::{NativeQuery, TranslatorRegistry};
