//! Elasticsearch translator.
//!
//! Produces a `_search` body. Documents are statements indexed under their
//! `id`; string fields are matched through their `.keyword` sub-field and
//! `timestamp` is mapped as `date_nanos`.

use serde_json::{json, Value};

use lrs_gateway_core::{Ifi, ReadQuery};

use super::sql::nanos;
use super::{activity_object_paths, agent_paths, context_activity_paths, dotted, NativeQuery};

/// Date format accepted for range bounds.
pub const DATE_FORMAT: &str = "strict_date_optional_time_nanos";

fn term(path: &[&str], value: &str) -> Value {
    let mut field = serde_json::Map::new();
    field.insert(format!("{}.keyword", dotted(path)), json!(value));
    json!({ "term": field })
}

fn any_of(clauses: Vec<Value>) -> Value {
    json!({ "bool": { "should": clauses, "minimum_should_match": 1 } })
}

fn ifi_at(path: &[&str], ifi: &Ifi) -> Value {
    let terms: Vec<Value> = ifi
        .field_pairs()
        .into_iter()
        .map(|(fields, value)| {
            let mut full = path.to_vec();
            full.extend_from_slice(fields);
            term(&full, value)
        })
        .collect();
    json!({ "bool": { "filter": terms } })
}

pub fn lower(query: &ReadQuery, size: usize) -> Value {
    let mut filter = Vec::new();

    if let Some(key) = query.statement_id {
        filter.push(json!({ "ids": { "values": [key.to_string()] } }));
    }

    if let Some(ifi) = &query.agent {
        filter.push(any_of(
            agent_paths(query.related_agents)
                .iter()
                .map(|path| ifi_at(path, ifi))
                .collect(),
        ));
    }

    if let Some(verb) = &query.verb {
        filter.push(term(&["verb", "id"], verb));
    }

    if let Some(activity) = &query.activity {
        let mut alternatives: Vec<Value> = activity_object_paths(query.related_activities)
            .iter()
            .map(|path| {
                let mut id = path.to_vec();
                id.push("id");
                let mut object_type = path.to_vec();
                object_type.push("objectType");
                json!({ "bool": {
                    "filter": [term(&id, activity)],
                    "should": [
                        { "bool": { "must_not": [{ "exists": { "field": dotted(&object_type) } }] } },
                        term(&object_type, "Activity"),
                    ],
                    "minimum_should_match": 1,
                } })
            })
            .collect();
        if query.related_activities {
            // Arrays flatten in the index, so one term covers both list
            // and single-object forms.
            for mut path in context_activity_paths() {
                path.push("id");
                alternatives.push(term(&path, activity));
            }
        }
        filter.push(any_of(alternatives));
    }

    if let Some(registration) = query.registration {
        filter.push(term(
            &["context", "registration"],
            &registration.hyphenated().to_string(),
        ));
    }

    if query.since.is_some() || query.until.is_some() {
        let mut range = serde_json::Map::new();
        if let Some(since) = &query.since {
            range.insert("gt".into(), json!(lrs_gateway_core::format_timestamp(since)));
        }
        if let Some(until) = &query.until {
            range.insert("lte".into(), json!(lrs_gateway_core::format_timestamp(until)));
        }
        range.insert("format".into(), json!(DATE_FORMAT));
        filter.push(json!({ "range": { "timestamp": range } }));
    }

    if let Some(authority) = &query.authority {
        filter.push(ifi_at(&["authority"], authority.ifi()));
    }

    if let Some(keys) = &query.voided_targets {
        // Keyword terms are case sensitive; ids arrive in either case.
        let ids: Vec<String> = keys
            .iter()
            .flat_map(|key| {
                let id = key.to_string();
                [id.to_uppercase(), id]
            })
            .collect();
        filter.push(term(&["object", "objectType"], "StatementRef"));
        filter.push(json!({ "terms": { "object.id.keyword": ids } }));
    }

    let order = if query.ascending { "asc" } else { "desc" };
    let mut body = json!({
        "query": { "bool": { "filter": filter } },
        "sort": [
            { "timestamp": { "order": order } },
            { "id.keyword": { "order": order } },
        ],
        "size": size,
        "track_total_hits": false,
    });

    if let Some(after) = &query.after {
        let sort = after
            .native
            .as_ref()
            .map(|native| native.get("sort").unwrap_or(native));
        let search_after = match sort {
            Some(Value::Array(values)) => Value::Array(values.clone()),
            _ => json!([nanos(&after.timestamp), after.id.to_string()]),
        };
        body["search_after"] = search_after;
    }

    body
}

pub fn translate(query: &ReadQuery, size: usize) -> NativeQuery {
    NativeQuery::Elasticsearch(lower(query, size))
}
