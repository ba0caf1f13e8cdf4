//! The canonical query model.
//!
//! [`StatementQuery`] is what callers send. [`ReadQuery`] is what a
//! translator lowers into an engine's native query: the caller's filters
//! plus the authority conjunct the store injects and the decoded resume
//! position. [`Page`] is what a read returns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::{Authority, Ifi};
use crate::cursor::{Cursor, CursorPosition};
use crate::statement::{Statement, VOIDED_VERB};
use crate::types::IdentityKey;

/// A statement query as received from a caller.
///
/// `statement_id` and `voided_statement_id` are exclusive with every other
/// filter; see [`validate_query`](crate::validation::validate_query).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatementQuery {
    pub statement_id: Option<IdentityKey>,
    pub voided_statement_id: Option<IdentityKey>,
    /// Actor filter (or any agent position, with `related_agents`).
    pub agent: Option<Ifi>,
    pub verb: Option<String>,
    /// Object activity filter (or any activity position, with
    /// `related_activities`).
    pub activity: Option<String>,
    pub registration: Option<Uuid>,
    pub related_activities: bool,
    pub related_agents: bool,
    /// Exclusive lower bound on `timestamp`.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `timestamp`.
    pub until: Option<DateTime<Utc>>,
    /// Only statements written under the caller's own authority.
    pub mine: bool,
    /// Maximum records per page. 0 means the server maximum.
    pub limit: usize,
    /// Oldest first when set; newest first otherwise.
    pub ascending: bool,
    pub cursor: Option<Cursor>,
}

impl StatementQuery {
    /// Query a single statement by id.
    pub fn by_id(key: IdentityKey) -> Self {
        Self {
            statement_id: Some(key),
            ..Self::default()
        }
    }

    /// Query a single voided statement by id.
    pub fn by_voided_id(key: IdentityKey) -> Self {
        Self {
            voided_statement_id: Some(key),
            ..Self::default()
        }
    }

    /// Continue from a cursor returned by a previous page.
    pub fn resume(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Does this query address a single statement by identity?
    pub fn is_identity_lookup(&self) -> bool {
        self.statement_id.is_some() || self.voided_statement_id.is_some()
    }
}

/// The lowered query handed to a translator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadQuery {
    pub statement_id: Option<IdentityKey>,
    pub agent: Option<Ifi>,
    pub verb: Option<String>,
    pub activity: Option<String>,
    pub registration: Option<Uuid>,
    pub related_activities: bool,
    pub related_agents: bool,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Exact-match conjunct on the stored authority. Only the store sets it.
    pub authority: Option<Authority>,
    /// Only voiding statements whose `StatementRef` names one of these ids.
    /// An empty list matches nothing.
    pub voided_targets: Option<Vec<IdentityKey>>,
    pub ascending: bool,
    /// Return only records strictly after this position in sort order.
    pub after: Option<CursorPosition>,
}

impl ReadQuery {
    /// Lower the filter fields of a caller query.
    ///
    /// Identity resolution, authority and the cursor are the store's
    /// business and are set separately.
    pub fn from_query(query: &StatementQuery) -> Self {
        Self {
            statement_id: query.statement_id,
            agent: query.agent.clone(),
            verb: query.verb.clone(),
            activity: query.activity.clone(),
            registration: query.registration,
            related_activities: query.related_activities,
            related_agents: query.related_agents,
            since: query.since,
            until: query.until,
            authority: None,
            voided_targets: None,
            ascending: query.ascending,
            after: None,
        }
    }

    /// Match a single statement by id.
    pub fn by_id(key: IdentityKey) -> Self {
        Self {
            statement_id: Some(key),
            ..Self::default()
        }
    }

    /// Match statements with the given verb.
    pub fn by_verb(verb: impl Into<String>) -> Self {
        Self {
            verb: Some(verb.into()),
            ..Self::default()
        }
    }

    /// Match the voiding statements that target any of `keys`.
    pub fn voiding(keys: impl IntoIterator<Item = IdentityKey>) -> Self {
        Self {
            verb: Some(VOIDED_VERB.to_string()),
            voided_targets: Some(keys.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn with_authority(mut self, authority: Option<Authority>) -> Self {
        self.authority = authority;
        self
    }

    pub fn after(mut self, position: Option<CursorPosition>) -> Self {
        self.after = position;
        self
    }
}

/// One page of a read.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Page {
    pub statements: Vec<Statement>,
    /// Present when more records may follow.
    #[serde(rename = "more", skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

impl Page {
    pub fn new(statements: Vec<Statement>, cursor: Option<Cursor>) -> Self {
        Self { statements, cursor }
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn has_more(&self) -> bool {
        self.cursor.is_some()
    }
}
