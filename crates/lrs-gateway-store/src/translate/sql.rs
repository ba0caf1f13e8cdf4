//! SQL translator for the SQLite adapter.
//!
//! The statements table keeps the full statement as JSON text in `event`
//! and a few flat columns for the hot filters. Everything else is reached
//! with `json_extract`.

use chrono::{DateTime, Utc};
use rusqlite::types::{ToSqlOutput, Value as SqlValue};
use rusqlite::ToSql;
use serde::Serialize;

use lrs_gateway_core::{Ifi, ReadQuery};

use super::{activity_object_paths, agent_paths, context_activity_paths, NativeQuery};

/// A bound parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SqlParam {
    Text(String),
    Integer(i64),
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlParam::Text(s) => ToSqlOutput::Owned(SqlValue::Text(s.clone())),
            SqlParam::Integer(n) => ToSqlOutput::Owned(SqlValue::Integer(*n)),
        })
    }
}

/// A `WHERE` clause with positional parameters, an order and a limit.
///
/// The adapter prepends its own `target = ?` conjunct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SqlQuery {
    pub where_clause: String,
    pub params: Vec<SqlParam>,
    pub order_by: String,
    pub limit: usize,
}

/// Timestamp as nanoseconds since the epoch, saturating outside the i64
/// range (years before 1677 or after 2262).
pub fn nanos(timestamp: &DateTime<Utc>) -> i64 {
    timestamp.timestamp_nanos_opt().unwrap_or(if timestamp.timestamp() < 0 {
        i64::MIN
    } else {
        i64::MAX
    })
}

fn json_path(path: &[&str]) -> String {
    format!("'$.{}'", path.join("."))
}

#[derive(Default)]
struct Builder {
    conjuncts: Vec<String>,
    params: Vec<SqlParam>,
}

impl Builder {
    fn text(&mut self, value: impl Into<String>) -> &'static str {
        self.params.push(SqlParam::Text(value.into()));
        "?"
    }

    fn integer(&mut self, value: i64) -> &'static str {
        self.params.push(SqlParam::Integer(value));
        "?"
    }

    fn ifi_at(&mut self, path: &[&str], ifi: &Ifi) -> String {
        let clauses: Vec<String> = ifi
            .field_pairs()
            .into_iter()
            .map(|(fields, value)| {
                let mut full = path.to_vec();
                full.extend_from_slice(fields);
                format!("json_extract(event, {}) = {}", json_path(&full), self.text(value))
            })
            .collect();
        format!("({})", clauses.join(" AND "))
    }
}

/// Lower a query into SQL.
pub fn lower(query: &ReadQuery, size: usize) -> SqlQuery {
    let mut b = Builder::default();

    if let Some(key) = query.statement_id {
        let clause = format!("event_id = {}", b.text(key.to_string()));
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
        let clause = format!("verb_id = {}", b.text(verb.as_str()));
        b.conjuncts.push(clause);
    }

    if let Some(activity) = &query.activity {
        let mut alternatives = Vec::new();
        for path in activity_object_paths(query.related_activities) {
            let mut id = path.to_vec();
            id.push("id");
            let mut object_type = path.to_vec();
            object_type.push("objectType");
            alternatives.push(format!(
                "(json_extract(event, {}) = {} AND COALESCE(json_extract(event, {}), 'Activity') = 'Activity')",
                json_path(&id),
                b.text(activity.as_str()),
                json_path(&object_type),
            ));
        }
        if query.related_activities {
            for path in context_activity_paths() {
                let list = json_path(&path);
                alternatives.push(format!(
                    "EXISTS (SELECT 1 FROM json_each(event, {list}) ca \
                     WHERE CASE WHEN ca.type = 'object' THEN json_extract(ca.value, '$.id') END = {})",
                    b.text(activity.as_str()),
                ));
                let mut single = path.clone();
                single.push("id");
                alternatives.push(format!(
                    "json_extract(event, {}) = {}",
                    json_path(&single),
                    b.text(activity.as_str()),
                ));
            }
        }
        b.conjuncts.push(format!("({})", alternatives.join(" OR ")));
    }

    if let Some(registration) = query.registration {
        let clause = format!(
            "lower(json_extract(event, '$.context.registration')) = {}",
            b.text(registration.hyphenated().to_string())
        );
        b.conjuncts.push(clause);
    }

    if let Some(since) = &query.since {
        let clause = format!("emission_time > {}", b.integer(nanos(since)));
        b.conjuncts.push(clause);
    }
    if let Some(until) = &query.until {
        let clause = format!("emission_time <= {}", b.integer(nanos(until)));
        b.conjuncts.push(clause);
    }

    if let Some(authority) = &query.authority {
        let clause = format!("authority = {}", b.text(authority.canonical()));
        b.conjuncts.push(clause);
    }

    if let Some(keys) = &query.voided_targets {
        let clause = if keys.is_empty() {
            "0".to_string()
        } else {
            let placeholders: Vec<&str> = keys.iter().map(|key| b.text(key.to_string())).collect();
            format!(
                "(json_extract(event, '$.object.objectType') = 'StatementRef' \
                 AND lower(json_extract(event, '$.object.id')) IN ({}))",
                placeholders.join(", ")
            )
        };
        b.conjuncts.push(clause);
    }

    let direction = if query.ascending { "ASC" } else { "DESC" };
    if let Some(after) = &query.after {
        let op = if query.ascending { ">" } else { "<" };
        let ts = nanos(&after.timestamp);
        let clause = format!(
            "(emission_time {op} {} OR (emission_time = {} AND event_id {op} {}))",
            b.integer(ts),
            b.integer(ts),
            b.text(after.id.to_string()),
        );
        b.conjuncts.push(clause);
    }

    let where_clause = if b.conjuncts.is_empty() {
        "1".to_string()
    } else {
        b.conjuncts.join(" AND ")
    };

    SqlQuery {
        where_clause,
        params: b.params,
        order_by: format!("emission_time {direction}, event_id {direction}"),
        limit: size,
    }
}

pub fn translate(query: &ReadQuery, size: usize) -> NativeQuery {
    NativeQuery::Sql(lower(query, size))
}
