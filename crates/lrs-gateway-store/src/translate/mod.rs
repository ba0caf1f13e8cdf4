//! Query translators.
//!
//! One pure function per engine family lowers a [`ReadQuery`] into that
//! engine's native query. Translators never see an invalid query: the
//! statement store validates before it translates.
//!
//! All translators share the same field semantics:
//!
//! | filter | matches |
//! |---|---|
//! | identity | `id` |
//! | agent | `actor` IFI, or every agent position with `related_agents` |
//! | verb | `verb.id` |
//! | activity | `object.id` of an Activity, plus context activities with `related_activities` |
//! | registration | `context.registration` |
//! | since / until | `timestamp > since`, `timestamp <= until` |
//! | authority | the stored `authority` IFI |
//! | voided targets | voiding statements whose `StatementRef` id is listed |
//! | after | keyset `(timestamp, id)` strictly beyond the position |
//!
//! Results are ordered by `timestamp` then `id`, both ascending or both
//! descending.

pub mod clickhouse;
pub mod es;
pub mod predicate;
pub mod sql;

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use lrs_gateway_core::statement::{
    CONTEXT_ACTIVITY_KINDS, RELATED_AGENT_PATHS, RELATED_CONTEXT_ROOTS,
};
use lrs_gateway_core::ReadQuery;

pub use clickhouse::ClickHouseQuery;
pub use predicate::{Predicate, PredicateQuery};
pub use sql::{SqlParam, SqlQuery};

/// A query in an engine's native form.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "engine", content = "query", rename_all = "lowercase")]
pub enum NativeQuery {
    /// In-process predicate evaluation.
    Predicate(PredicateQuery),
    Sql(SqlQuery),
    ClickHouse(ClickHouseQuery),
    /// An Elasticsearch `_search` body.
    Elasticsearch(Value),
}

/// Signature shared by every translator: query and chunk size in, native
/// query out. Total over valid queries.
pub type TranslateFn = fn(&ReadQuery, usize) -> NativeQuery;

/// Translators keyed by backend name.
#[derive(Clone, Default)]
pub struct TranslatorRegistry {
    translators: HashMap<&'static str, TranslateFn>,
}

impl TranslatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The translators for every built-in engine.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("memory", predicate::translate);
        registry.register("fs", predicate::translate);
        registry.register("sqlite", sql::translate);
        registry.register("clickhouse", clickhouse::translate);
        registry.register("es", es::translate);
        registry
    }

    pub fn register(&mut self, backend: &'static str, translate: TranslateFn) {
        self.translators.insert(backend, translate);
    }

    pub fn get(&self, backend: &str) -> Option<TranslateFn> {
        self.translators.get(backend).copied()
    }

    /// Translate for `backend`, or `None` when no translator is registered.
    pub fn translate(&self, backend: &str, query: &ReadQuery, size: usize) -> Option<NativeQuery> {
        self.get(backend).map(|translate| translate(query, size))
    }

    /// Registered backend names, sorted.
    pub fn backends(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.translators.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for TranslatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatorRegistry")
            .field("backends", &self.backends())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared field positions
// ─────────────────────────────────────────────────────────────────────────────

const ACTOR_ONLY: &[&[&str]] = &[&["actor"]];
const OBJECT_ONLY: &[&[&str]] = &[&["object"]];
const OBJECT_AND_SUBSTATEMENT: &[&[&str]] = &[&["object"], &["object", "object"]];

/// Positions of agent objects an agent filter inspects.
pub(crate) fn agent_paths(related: bool) -> &'static [&'static [&'static str]] {
    if related {
        RELATED_AGENT_PATHS
    } else {
        ACTOR_ONLY
    }
}

/// Positions of objects whose `id` an activity filter compares. The object
/// must also have no `objectType` or `objectType = "Activity"`.
pub(crate) fn activity_object_paths(related: bool) -> &'static [&'static [&'static str]] {
    if related {
        OBJECT_AND_SUBSTATEMENT
    } else {
        OBJECT_ONLY
    }
}

/// Every `contextActivities` list a related-activities filter inspects.
///
/// Each list holds activity objects, or a single activity object in the
/// older non-array form.
pub(crate) fn context_activity_paths() -> Vec<Vec<&'static str>> {
    RELATED_CONTEXT_ROOTS
        .iter()
        .flat_map(|root| {
            CONTEXT_ACTIVITY_KINDS.iter().map(move |kind| {
                let mut path = root.to_vec();
                path.push("contextActivities");
                path.push(*kind);
                path
            })
        })
        .collect()
}

/// Join a path with dots, as document stores address nested fields.
pub(crate) fn dotted(path: &[&str]) -> String {
    path.join(".")
}
