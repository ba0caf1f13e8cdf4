//! # LRS Gateway Forward
//!
//! Fire-and-forget replication of accepted statements to downstream LRS
//! endpoints, with an independent timeout and retry budget per target.
//!
//! ## Key Types
//!
//! - [`ForwardingTarget`] - A validated downstream endpoint
//! - [`ForwardTransport`] - One delivery attempt ([`HttpTransport`], or
//!   [`memory::MemoryTransport`] in tests)
//! - [`ForwardingDispatcher`] - Spawns per-target delivery with backoff
//! - [`PartialForwardingFailure`] - A target that exhausted its retries
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lrs_gateway_forward::{
//!     DispatchSettings, ForwardingDispatcher, ForwardingTarget, HttpTransport, RawForwardingEntry,
//! };
//!
//! async fn example(entries: Vec<RawForwardingEntry>) {
//!     let targets = ForwardingTarget::from_entries(entries);
//!     let dispatcher = ForwardingDispatcher::new(
//!         targets,
//!         Arc::new(HttpTransport::new()),
//!         DispatchSettings::default(),
//!     );
//!
//!     // let statements: Vec<Statement> = ...;
//!     // let report = dispatcher.dispatch(statements).wait().await;
//! }
//! ```

pub mod dispatcher;
pub mod error;
pub mod target;
pub mod transport;

pub use dispatcher::{
    DispatchHandle, DispatchReport, DispatchSettings, ForwardingDispatcher,
    PartialForwardingFailure, TargetOutcome,
};
pub use error::{ForwardError, Result};
pub use target::{ForwardingTarget, RawForwardingEntry, MAX_RETRIES};
pub use transport::{memory, ForwardTransport, HttpTransport, XAPI_VERSION, XAPI_VERSION_HEADER};
