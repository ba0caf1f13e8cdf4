//! # LRS Gateway Core
//!
//! Pure primitives for the LRS gateway: statements, identity keys, targets,
//! the canonical query model, cursors and principals.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`Statement`] - One immutable learning-event record
//! - [`IdentityKey`] - The UUID identifying a statement within a target
//! - [`Target`] - The partition a backend operation addresses
//! - [`StatementQuery`] - The canonical query callers send
//! - [`ReadQuery`] - The lowered form translators receive
//! - [`Cursor`] - Opaque pagination token
//! - [`Principal`] - A resolved caller with authority and scopes
//!
//! ## Validation
//!
//! Query validation ([`validate_query`]) runs before translation. Record
//! validation is a collaborator ([`RecordValidator`]); [`StructuralValidator`]
//! is the built-in minimal implementation.

pub mod agent;
pub mod canonical;
pub mod cursor;
pub mod error;
pub mod principal;
pub mod query;
pub mod statement;
pub mod types;
pub mod validation;

pub use agent::{Authority, Ifi};
pub use canonical::canonical_json;
pub use cursor::{Cursor, CursorPosition};
pub use error::{CoreError, ValidationError};
pub use principal::{Principal, Scope};
pub use query::{Page, ReadQuery, StatementQuery};
pub use statement::{format_timestamp, parse_timestamp, Statement, VOIDED_VERB};
pub use types::{ContentDigest, IdentityKey, Target, DEFAULT_TARGET};
pub use validation::{validate_query, RecordValidator, RejectionReason, StructuralValidator};
