//! # LRS Gateway Testkit
//!
//! Testing utilities for the LRS gateway.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Query vectors**: A fixed statement corpus and named queries every
//!   translator and adapter must agree on
//! - **Generators**: Proptest strategies for statements and queries
//! - **Fixtures**: Statement builders and principals
//! - **Fault injection**: [`FaultyBackend`] wraps any backend with call
//!   counters and injected failures
//!
//! ## Query Vectors
//!
//! ```rust
//! use lrs_gateway_store::TranslatorRegistry;
//! use lrs_gateway_testkit::vectors::all_query_vectors;
//!
//! let registry = TranslatorRegistry::builtin();
//! for vector in all_query_vectors() {
//!     for backend in registry.backends() {
//!         assert!(registry.translate(backend, &vector.query, 10).is_some());
//!     }
//! }
//! ```
//!
//! ## Fixtures
//!
//! ```rust
//! use lrs_gateway_testkit::fixtures::{admin, StatementFactory};
//!
//! let factory = StatementFactory::new();
//! let batch = factory.batch(10);
//! let principal = admin();
//! ```

pub mod backend;
pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use backend::FaultyBackend;
pub use fixtures::{admin, principal, StatementFactory};
pub use vectors::{all_query_vectors, corpus, QueryVector};

/// Install a test-friendly `tracing` subscriber filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
