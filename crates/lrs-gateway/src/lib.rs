//! # LRS Gateway
//!
//! Statement store semantics over pluggable data backends, with forwarding
//! of accepted statements to downstream LRS endpoints.
//!
//! ## Overview
//!
//! - **Statements** are immutable. Reusing an id with the same content is
//!   a no-op, with different content a conflict.
//! - **Voiding** hides a statement from filtered reads without deleting it.
//! - **Authority** is stamped on every write and can confine reads.
//! - **Backends** are chosen by name from a registry and advertise what
//!   they can do: read, write, list.
//! - **Forwarding** replicates accepted statements in the background. A
//!   failing downstream never fails a write.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lrs_gateway::{GatewayConfig, StatementStore, StatementQuery};
//! use lrs_gateway::core::{Authority, Ifi, Principal, Scope};
//! use serde_json::json;
//!
//! async fn example() -> lrs_gateway::Result<()> {
//!     let config = GatewayConfig::from_file("gateway.toml")?;
//!     let store = StatementStore::open(config)?;
//!     let target = store.default_target().clone();
//!
//!     let principal = Principal::new(
//!         "client-1",
//!         Authority::new(Ifi::Mbox("mailto:client@example.com".into())),
//!         [Scope::All],
//!     );
//!
//!     let result = store
//!         .write(
//!             &principal,
//!             vec![json!({
//!                 "actor": { "mbox": "mailto:learner@example.com" },
//!                 "verb": { "id": "http://adlnet.gov/expapi/verbs/completed" },
//!                 "object": { "id": "http://example.com/course" }
//!             })],
//!             &target,
//!         )
//!         .await?;
//!     println!("stored {:?}", result.ids);
//!
//!     let query = StatementQuery {
//!         limit: 25,
//!         ..Default::default()
//!     };
//!     let page = store.read(&principal, &query, &target).await?;
//!     println!("{} statements, more: {}", page.len(), page.has_more());
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `lrs_gateway::core` - Statements, queries, cursors, principals
//! - `lrs_gateway::store` - Backends, pipeline, translators, registry
//! - `lrs_gateway::forward` - Forwarding targets and dispatcher

pub mod config;
pub mod error;
pub mod statements;

// Re-export component crates
pub use lrs_gateway_core as core;
pub use lrs_gateway_forward as forward;
pub use lrs_gateway_store as store;

// Re-export main types for convenience
pub use config::{GatewayConfig, ReadSettings, WriteSettings};
pub use error::{GatewayError, Result};
pub use statements::{StatementStore, WriteResult};

pub use lrs_gateway_core::{
    Cursor, IdentityKey, Page, Principal, Scope, Statement, StatementQuery, Target,
};
pub use lrs_gateway_store::{BackendRegistry, BackendStatus, OnConflict};
