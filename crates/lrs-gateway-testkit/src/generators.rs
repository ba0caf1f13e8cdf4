//! Proptest generators for property-based testing.
//!
//! Names are drawn from small pools shared with [`crate::vectors`] so that
//! generated queries actually match corpus statements.

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};

use lrs_gateway_core::{
    format_timestamp, CursorPosition, IdentityKey, Ifi, ReadQuery, StatementQuery,
};

use crate::fixtures::{activity, mbox, ATTEMPTED, COMPLETED, EXPERIENCED};
use crate::vectors::{corpus_authority, corpus_key, corpus_timestamp, REGISTRATION};

/// Generate an identity key.
pub fn identity_key() -> impl Strategy<Value = IdentityKey> {
    any::<u128>().prop_map(|n| IdentityKey(uuid::Uuid::from_u128(n)))
}

/// Generate an agent identifier from the shared pool.
pub fn ifi() -> impl Strategy<Value = Ifi> {
    prop_oneof![
        (0usize..4).prop_map(|n| mbox(&format!("learner-{n}"))),
        Just(mbox("instructor")),
        Just(Ifi::Account {
            home_page: "https://sso.example.com".to_string(),
            name: "learner-9".to_string(),
        }),
    ]
}

/// Generate a verb IRI.
pub fn verb() -> impl Strategy<Value = String> {
    prop_oneof![Just(EXPERIENCED), Just(COMPLETED), Just(ATTEMPTED)].prop_map(String::from)
}

/// Generate an activity IRI.
pub fn activity_id() -> impl Strategy<Value = String> {
    prop_oneof![
        (0usize..5).prop_map(|n| activity(&format!("course-{n}"))),
        (0usize..3).prop_map(|n| activity(&format!("module-{n}"))),
    ]
}

/// Generate a timestamp within the corpus span.
pub fn timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..30).prop_map(|s| Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + Duration::seconds(s))
}

/// Generate a raw statement with an id and timestamp.
pub fn raw_statement() -> impl Strategy<Value = Value> {
    (identity_key(), ifi(), verb(), activity_id(), timestamp()).prop_map(
        |(key, actor, verb, object, at)| {
            json!({
                "id": key.to_string(),
                "actor": actor.to_agent(),
                "verb": { "id": verb },
                "object": { "objectType": "Activity", "id": object },
                "timestamp": format_timestamp(&at),
            })
        },
    )
}

/// Generate a valid filtered caller query: no identity filter, no cursor.
pub fn statement_query() -> impl Strategy<Value = StatementQuery> {
    (
        proptest::option::of(ifi()),
        proptest::option::of(verb()),
        proptest::option::of(activity_id()),
        any::<(bool, bool, bool, bool)>(),
        proptest::option::of(timestamp()),
        proptest::option::of(timestamp()),
        0usize..50,
    )
        .prop_map(
            |(agent, verb, activity, (related_agents, related_activities, ascending, mine), since, until, limit)| {
                let (since, until) = match (since, until) {
                    (Some(a), Some(b)) if a > b => (Some(b), Some(a)),
                    window => window,
                };
                StatementQuery {
                    agent,
                    verb,
                    activity,
                    related_agents,
                    related_activities,
                    ascending,
                    mine,
                    since,
                    until,
                    limit,
                    ..StatementQuery::default()
                }
            },
        )
}

/// Generate a lowered query, including authority, registration and a
/// resume position over the corpus.
pub fn read_query() -> impl Strategy<Value = ReadQuery> {
    (
        statement_query(),
        any::<bool>(),
        proptest::option::of(0usize..2),
        proptest::option::of(0usize..40),
    )
        .prop_map(|(query, registration, authority, after)| {
            let mut lowered = ReadQuery::from_query(&query)
                .with_authority(authority.map(corpus_authority))
                .after(after.map(|i| CursorPosition::new(corpus_timestamp(i), corpus_key(i))));
            if registration {
                lowered.registration = Some(REGISTRATION);
            }
            lowered
        })
}
