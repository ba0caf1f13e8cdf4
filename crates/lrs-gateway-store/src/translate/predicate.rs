//! In-process predicate translator, used by the memory and fs adapters.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use lrs_gateway_core::{Authority, Ifi, IdentityKey, ReadQuery, Statement};

use super::{activity_object_paths, agent_paths, context_activity_paths, NativeQuery};
use crate::backend::StoredRecord;

/// One conjunct of a predicate query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Id(IdentityKey),
    Agent { ifi: Ifi, related: bool },
    Verb(String),
    Activity { id: String, related: bool },
    Registration(Uuid),
    Since(DateTime<Utc>),
    Until(DateTime<Utc>),
    Authority(Authority),
    /// A voiding statement targeting one of these ids.
    VoidedTargets(Vec<IdentityKey>),
    /// Keyset position: strictly after it in sort order.
    After {
        timestamp: DateTime<Utc>,
        id: IdentityKey,
        ascending: bool,
    },
}

impl Predicate {
    pub fn matches(&self, record: &StoredRecord) -> bool {
        let statement = &record.statement;
        match self {
            Predicate::Id(key) => record.key == *key,
            Predicate::Agent { ifi, related } => agent_paths(*related)
                .iter()
                .any(|path| statement.pointer(path).map_or(false, |agent| ifi.matches(agent))),
            Predicate::Verb(verb) => statement.verb_id() == Some(verb.as_str()),
            Predicate::Activity { id, related } => activity_matches(statement, id, *related),
            Predicate::Registration(registration) => statement
                .str_at(&["context", "registration"])
                .and_then(|s| Uuid::parse_str(s).ok())
                == Some(*registration),
            Predicate::Since(since) => record.timestamp > *since,
            Predicate::Until(until) => record.timestamp <= *until,
            Predicate::Authority(authority) => statement
                .get("authority")
                .map_or(false, |agent| authority.ifi().matches(agent)),
            Predicate::VoidedTargets(keys) => statement
                .voided_target()
                .map_or(false, |key| keys.contains(&key)),
            Predicate::After {
                timestamp,
                id,
                ascending,
            } => {
                let order = (record.timestamp, record.key).cmp(&(*timestamp, *id));
                if *ascending {
                    order == Ordering::Greater
                } else {
                    order == Ordering::Less
                }
            }
        }
    }
}

fn activity_matches(statement: &Statement, id: &str, related: bool) -> bool {
    let object_match = activity_object_paths(related).iter().any(|path| {
        statement.pointer(path).map_or(false, |object| {
            object.get("id").and_then(Value::as_str) == Some(id)
                && matches!(
                    object.get("objectType").and_then(Value::as_str),
                    None | Some("Activity")
                )
        })
    });
    if object_match || !related {
        return object_match;
    }

    context_activity_paths().iter().any(|path| {
        let has_id = |activity: &Value| activity.get("id").and_then(Value::as_str) == Some(id);
        match statement.pointer(path) {
            Some(Value::Array(activities)) => activities.iter().any(has_id),
            Some(activity @ Value::Object(_)) => has_id(activity),
            _ => false,
        }
    })
}

/// A conjunction of predicates with an order and a limit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredicateQuery {
    pub predicates: Vec<Predicate>,
    pub ascending: bool,
    pub limit: usize,
}

impl PredicateQuery {
    pub fn matches(&self, record: &StoredRecord) -> bool {
        self.predicates.iter().all(|p| p.matches(record))
    }

    /// Order records by `(timestamp, id)` in query direction.
    pub fn sort(&self, records: &mut [StoredRecord]) {
        records.sort_by(|a, b| {
            let order = (a.timestamp, a.key).cmp(&(b.timestamp, b.key));
            if self.ascending {
                order
            } else {
                order.reverse()
            }
        });
    }

    /// Filter, sort and truncate a full record set.
    pub fn apply(&self, records: impl IntoIterator<Item = StoredRecord>) -> Vec<StoredRecord> {
        let mut matched: Vec<_> = records.into_iter().filter(|r| self.matches(r)).collect();
        self.sort(&mut matched);
        matched.truncate(self.limit);
        matched
    }

    /// [`apply`](Self::apply) over borrowed records, cloning only matches.
    pub fn apply_ref<'a>(
        &self,
        records: impl IntoIterator<Item = &'a StoredRecord>,
    ) -> Vec<StoredRecord> {
        self.apply(records.into_iter().filter(|r| self.matches(r)).cloned())
    }
}

/// Lower a query into predicates.
pub fn lower(query: &ReadQuery, size: usize) -> PredicateQuery {
    let mut predicates = Vec::new();

    if let Some(key) = query.statement_id {
        predicates.push(Predicate::Id(key));
    }
    if let Some(ifi) = &query.agent {
        predicates.push(Predicate::Agent {
            ifi: ifi.clone(),
            related: query.related_agents,
        });
    }
    if let Some(verb) = &query.verb {
        predicates.push(Predicate::Verb(verb.clone()));
    }
    if let Some(activity) = &query.activity {
        predicates.push(Predicate::Activity {
            id: activity.clone(),
            related: query.related_activities,
        });
    }
    if let Some(registration) = query.registration {
        predicates.push(Predicate::Registration(registration));
    }
    if let Some(since) = query.since {
        predicates.push(Predicate::Since(since));
    }
    if let Some(until) = query.until {
        predicates.push(Predicate::Until(until));
    }
    if let Some(authority) = &query.authority {
        predicates.push(Predicate::Authority(authority.clone()));
    }
    if let Some(keys) = &query.voided_targets {
        predicates.push(Predicate::VoidedTargets(keys.clone()));
    }
    if let Some(after) = &query.after {
        predicates.push(Predicate::After {
            timestamp: after.timestamp,
            id: after.id,
            ascending: query.ascending,
        });
    }

    PredicateQuery {
        predicates,
        ascending: query.ascending,
        limit: size,
    }
}

pub fn translate(query: &ReadQuery, size: usize) -> NativeQuery {
    NativeQuery::Predicate(lower(query, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lrs_gateway_core::CursorPosition;
    use serde_json::json;

    fn record(value: Value) -> StoredRecord {
        StoredRecord::from_statement(Statement::from_value(value).unwrap()).unwrap()
    }

    fn statement_with(extra: Value) -> StoredRecord {
        let mut base = json!({
            "id": IdentityKey::generate().to_string(),
            "actor": { "mbox": "mailto:learner@example.com" },
            "verb": { "id": "http://adlnet.gov/expapi/verbs/completed" },
            "object": { "id": "http://example.com/course/1" },
            "timestamp": "2024-03-01T10:00:00Z"
        });
        for (k, v) in extra.as_object().unwrap() {
            base[k] = v.clone();
        }
        record(base)
    }

    #[test]
    fn test_activity_direct_and_related() {
        let r = statement_with(json!({
            "context": { "contextActivities": { "parent": [{ "id": "http://example.com/program" }] } }
        }));

        let direct = lower(
            &ReadQuery {
                activity: Some("http://example.com/course/1".into()),
                ..ReadQuery::default()
            },
            10,
        );
        assert!(direct.matches(&r));

        let parent_only = ReadQuery {
            activity: Some("http://example.com/program".into()),
            ..ReadQuery::default()
        };
        assert!(!lower(&parent_only, 10).matches(&r));

        let related = ReadQuery {
            related_activities: true,
            ..parent_only
        };
        assert!(lower(&related, 10).matches(&r));
    }

    #[test]
    fn test_activity_requires_activity_object_type() {
        let r = statement_with(json!({
            "object": { "objectType": "Agent", "id": "http://example.com/course/1" }
        }));
        let query = ReadQuery {
            activity: Some("http://example.com/course/1".into()),
            ..ReadQuery::default()
        };
        assert!(!lower(&query, 10).matches(&r));
    }

    #[test]
    fn test_context_activity_object_form() {
        let r = statement_with(json!({
            "context": { "contextActivities": { "category": { "id": "http://example.com/cat" } } }
        }));
        let query = ReadQuery {
            activity: Some("http://example.com/cat".into()),
            related_activities: true,
            ..ReadQuery::default()
        };
        assert!(lower(&query, 10).matches(&r));
    }

    #[test]
    fn test_related_agents_search_instructor() {
        let instructor = Ifi::Mbox("mailto:teacher@example.com".into());
        let r = statement_with(json!({
            "context": { "instructor": { "mbox": "mailto:teacher@example.com" } }
        }));
        let query = ReadQuery {
            agent: Some(instructor),
            ..ReadQuery::default()
        };
        assert!(!lower(&query, 10).matches(&r));
        let related = ReadQuery {
            related_agents: true,
            ..query
        };
        assert!(lower(&related, 10).matches(&r));
    }

    #[test]
    fn test_registration_compares_uuids() {
        let registration = Uuid::new_v4();
        let r = statement_with(json!({
            "context": { "registration": registration.to_string().to_uppercase() }
        }));
        let query = ReadQuery {
            registration: Some(registration),
            ..ReadQuery::default()
        };
        assert!(lower(&query, 10).matches(&r));
    }

    #[test]
    fn test_time_bounds_are_exclusive_then_inclusive() {
        let r = statement_with(json!({}));
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        let since = ReadQuery {
            since: Some(at),
            ..ReadQuery::default()
        };
        assert!(!lower(&since, 10).matches(&r));

        let until = ReadQuery {
            until: Some(at),
            ..ReadQuery::default()
        };
        assert!(lower(&until, 10).matches(&r));
    }

    #[test]
    fn test_apply_orders_and_resumes() {
        let records: Vec<_> = (0..5)
            .map(|i| statement_with(json!({ "timestamp": format!("2024-03-01T10:00:0{i}Z") })))
            .collect();

        let first = lower(&ReadQuery::default(), 2).apply(records.clone());
        assert_eq!(first.len(), 2);
        assert!(first[0].timestamp > first[1].timestamp);

        let resume = ReadQuery::default().after(Some(CursorPosition::new(
            first[1].timestamp,
            first[1].key,
        )));
        let second = lower(&resume, 10).apply(records.clone());
        assert_eq!(second.len(), 3);
        assert!(second.iter().all(|r| r.timestamp < first[1].timestamp));

        let ascending = ReadQuery {
            ascending: true,
            ..ReadQuery::default()
        };
        let all = lower(&ascending, 10).apply(records);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_authority_conjunct() {
        let authority = Authority::new(Ifi::Mbox("mailto:lrs@example.com".into()));
        let mine = statement_with(json!({ "authority": authority.to_agent() }));
        let theirs = statement_with(json!({ "authority": { "mbox": "mailto:other@example.com" } }));
        let query = lower(&ReadQuery::default().with_authority(Some(authority)), 10);
        assert!(query.matches(&mine));
        assert!(!query.matches(&theirs));
    }

    #[test]
    fn test_voided_targets_match_statement_refs_only() {
        let wanted = IdentityKey::generate();
        let void = |object: Value| {
            statement_with(json!({
                "verb": { "id": lrs_gateway_core::VOIDED_VERB },
                "object": object
            }))
        };
        let hit = void(json!({
            "objectType": "StatementRef",
            "id": wanted.to_string().to_uppercase()
        }));
        let other = void(json!({
            "objectType": "StatementRef",
            "id": IdentityKey::generate().to_string()
        }));
        let activity = void(json!({ "id": wanted.to_string() }));

        let query = lower(&ReadQuery::voiding([wanted]), 10);
        assert!(query.matches(&hit));
        assert!(!query.matches(&other));
        assert!(!query.matches(&activity));
        assert!(!lower(&ReadQuery::voiding([]), 10).matches(&hit));
    }
}
