//! ClickHouse translator.
//!
//! Values never enter the SQL text: every one is a typed query parameter
//! (`{p0:String}`) sent alongside the query as `param_p0`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use lrs_gateway_core::{Ifi, ReadQuery};

use super::{activity_object_paths, agent_paths, context_activity_paths, NativeQuery};

/// Parameter type used for every timestamp.
pub const DATETIME_TYPE: &str = "DateTime64(9, 'UTC')";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClickHouseQuery {
    pub where_clause: String,
    /// Parameter values by name, without the `param_` prefix.
    pub params: BTreeMap<String, String>,
    pub order_by: String,
    pub limit: usize,
}

/// Render a timestamp the way ClickHouse parses `DateTime64(9)`.
pub fn format_datetime(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

fn json_args(path: &[&str]) -> String {
    path.iter()
        .map(|key| format!("'{key}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn extract(path: &[&str]) -> String {
    format!("JSONExtractString(event, {})", json_args(path))
}

#[derive(Default)]
struct Builder {
    conjuncts: Vec<String>,
    params: BTreeMap<String, String>,
}

impl Builder {
    fn param(&mut self, ty: &str, value: impl Into<String>) -> String {
        let name = format!("p{}", self.params.len());
        let placeholder = format!("{{{name}:{ty}}}");
        self.params.insert(name, value.into());
        placeholder
    }

    fn ifi_at(&mut self, path: &[&str], ifi: &Ifi) -> String {
        let clauses: Vec<String> = ifi
            .field_pairs()
            .into_iter()
            .map(|(fields, value)| {
                let mut full = path.to_vec();
                full.extend_from_slice(fields);
                format!("{} = {}", extract(&full), self.param("String", value))
            })
            .collect();
        format!("({})", clauses.join(" AND "))
    }
}

pub fn lower(query: &ReadQuery, size: usize) -> ClickHouseQuery {
    let mut b = Builder::default();

    if let Some(key) = query.statement_id {
        let clause = format!("event_id = {}", b.param("String", key.to_string()));
        b.conjuncts.push(clause);
    }

    if let Some(ifi) = &query.agent {
        let alternatives: Vec<String> = agent_paths(query.related_agents)
            .iter()
            .map(|path| b.ifi_at(path, ifi))
            .collect();
        b.conjuncts.push(format!("({})", alternatives.join(" OR ")));
    }

    if let Some(verb) = &query.verb {
        let clause = format!("verb_id = {}", b.param("String", verb.as_str()));
        b.conjuncts.push(clause);
    }

    if let Some(activity) = &query.activity {
        let id = b.param("String", activity.as_str());
        let mut alternatives = Vec::new();
        for path in activity_object_paths(query.related_activities) {
            let mut id_path = path.to_vec();
            id_path.push("id");
            let mut type_path = path.to_vec();
            type_path.push("objectType");
            alternatives.push(format!(
                "({} = {id} AND {} IN ('', 'Activity'))",
                extract(&id_path),
                extract(&type_path),
            ));
        }
        if query.related_activities {
            for path in context_activity_paths() {
                alternatives.push(format!(
                    "has(arrayMap(x -> JSONExtractString(x, 'id'), JSONExtractArrayRaw(event, {})), {id})",
                    json_args(&path),
                ));
                let mut single = path.clone();
                single.push("id");
                alternatives.push(format!("{} = {id}", extract(&single)));
            }
        }
        b.conjuncts.push(format!("({})", alternatives.join(" OR ")));
    }

    if let Some(registration) = query.registration {
        let clause = format!(
            "lower({}) = {}",
            extract(&["context", "registration"]),
            b.param("String", registration.hyphenated().to_string())
        );
        b.conjuncts.push(clause);
    }

    if let Some(since) = &query.since {
        let clause = format!(
            "emission_time > {}",
            b.param(DATETIME_TYPE, format_datetime(since))
        );
        b.conjuncts.push(clause);
    }
    if let Some(until) = &query.until {
        let clause = format!(
            "emission_time <= {}",
            b.param(DATETIME_TYPE, format_datetime(until))
        );
        b.conjuncts.push(clause);
    }

    if let Some(authority) = &query.authority {
        let clause = format!("authority = {}", b.param("String", authority.canonical()));
        b.conjuncts.push(clause);
    }

    if let Some(keys) = &query.voided_targets {
        let clause = if keys.is_empty() {
            "0".to_string()
        } else {
            let placeholders: Vec<String> = keys
                .iter()
                .map(|key| b.param("String", key.to_string()))
                .collect();
            format!(
                "({} = 'StatementRef' AND lower({}) IN ({}))",
                extract(&["object", "objectType"]),
                extract(&["object", "id"]),
                placeholders.join(", ")
            )
        };
        b.conjuncts.push(clause);
    }

    let direction = if query.ascending { "ASC" } else { "DESC" };
    if let Some(after) = &query.after {
        let op = if query.ascending { ">" } else { "<" };
        let ts = b.param(DATETIME_TYPE, format_datetime(&after.timestamp));
        let id = b.param("String", after.id.to_string());
        b.conjuncts.push(format!(
            "(emission_time {op} {ts} OR (emission_time = {ts} AND event_id {op} {id}))"
        ));
    }

    let where_clause = if b.conjuncts.is_empty() {
        "1".to_string()
    } else {
        b.conjuncts.join(" AND ")
    };

    ClickHouseQuery {
        where_clause,
        params: b.params,
        order_by: format!("emission_time {direction}, event_id {direction}"),
        limit: size,
    }
}

pub fn translate(query: &ReadQuery, size: usize) -> NativeQuery {
    NativeQuery::ClickHouse(lower(query, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lrs_gateway_core::{CursorPosition, IdentityKey};

    #[test]
    fn test_values_are_parameters() {
        let query = ReadQuery {
            verb: Some("http://adlnet.gov/expapi/verbs/completed'; DROP TABLE x".into()),
            ..ReadQuery::default()
        };
        let ch = lower(&query, 10);
        assert_eq!(ch.where_clause, "verb_id = {p0:String}");
        assert_eq!(
            ch.params.get("p0").map(String::as_str),
            Some("http://adlnet.gov/expapi/verbs/completed'; DROP TABLE x")
        );
    }

    #[test]
    fn test_datetime_keeps_nanoseconds() {
        let ts = Utc.timestamp_opt(1_700_000_000, 5).unwrap();
        assert_eq!(format_datetime(&ts), "2023-11-14 22:13:20.000000005");
    }

    #[test]
    fn test_related_activity_uses_array_functions() {
        let query = ReadQuery {
            activity: Some("http://example.com/a".into()),
            related_activities: true,
            ..ReadQuery::default()
        };
        let ch = lower(&query, 10);
        assert!(ch.where_clause.contains(
            "JSONExtractArrayRaw(event, 'context', 'contextActivities', 'parent')"
        ));
        assert_eq!(ch.params.len(), 1);
    }

    #[test]
    fn test_voided_targets_are_parameters() {
        let key = IdentityKey::generate();
        let ch = lower(&ReadQuery::voiding([key]), 10);
        assert!(ch.where_clause.contains(
            "lower(JSONExtractString(event, 'object', 'id')) IN ({p1:String})"
        ));
        assert_eq!(ch.params.get("p1"), Some(&key.to_string()));
    }

    #[test]
    fn test_keyset_reuses_timestamp_parameter() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let query = ReadQuery::default().after(Some(CursorPosition::new(ts, IdentityKey::generate())));
        let ch = lower(&query, 10);
        assert_eq!(ch.params.len(), 2);
        assert!(ch.where_clause.contains("emission_time < {p0:DateTime64(9, 'UTC')}"));
        assert!(ch.where_clause.contains("event_id < {p1:String}"));
    }
}
