//! Canonical query vectors.
//!
//! A fixed corpus of stamped statements plus a set of named queries over
//! it. Every translator must accept every vector, and every adapter must
//! return the same records in the same order for each of them.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use lrs_gateway_core::{
    format_timestamp, Authority, CursorPosition, IdentityKey, ReadQuery, Statement,
};

use crate::fixtures::{activity, mbox, ATTEMPTED, COMPLETED, EXPERIENCED};

/// Number of statements in [`corpus`].
pub const CORPUS_SIZE: usize = 40;

/// Registration shared by the even-numbered corpus statements.
pub const REGISTRATION: Uuid = Uuid::from_u128(0x5eed_0000_0000_4000_8000_0000_0000_0001);

/// A named query over the corpus.
#[derive(Debug, Clone)]
pub struct QueryVector {
    pub name: &'static str,
    pub query: ReadQuery,
}

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
}

/// Identity key of the `i`-th corpus statement. Unrelated to timestamp
/// order so ties are broken by id, not insertion.
pub fn corpus_key(i: usize) -> IdentityKey {
    let mixed = (i as u128 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15_f39c_c060_5ced_c835);
    IdentityKey(Uuid::from_u128(mixed))
}

/// Timestamp of the `i`-th corpus statement. Pairs share a timestamp.
pub fn corpus_timestamp(i: usize) -> DateTime<Utc> {
    base() + Duration::seconds((i / 2) as i64)
}

/// Authority the `i`-th corpus statement was written under.
pub fn corpus_authority(i: usize) -> Authority {
    let client = if i % 2 == 0 { "client-a" } else { "client-b" };
    Authority::new(mbox(client))
}

/// The fixed statement corpus.
pub fn corpus() -> Vec<Statement> {
    (0..CORPUS_SIZE).map(corpus_statement).collect()
}

fn corpus_statement(i: usize) -> Statement {
    let verb = [EXPERIENCED, COMPLETED, ATTEMPTED][i % 3];
    let object = if i % 7 == 0 {
        json!({ "objectType": "Agent", "mbox": "mailto:learner-0@example.com" })
    } else {
        json!({ "objectType": "Activity", "id": activity(&format!("course-{}", i % 5)) })
    };

    let mut value = json!({
        "id": corpus_key(i).to_string(),
        "actor": mbox(&format!("learner-{}", i % 4)).to_agent(),
        "verb": { "id": verb },
        "object": object,
        "timestamp": format_timestamp(&corpus_timestamp(i)),
    });
    if i % 2 == 0 {
        value["context"] = json!({
            "registration": REGISTRATION.to_string(),
            "contextActivities": {
                "parent": [{ "id": activity(&format!("module-{}", i % 3)) }]
            }
        });
        if i % 6 == 0 {
            value["context"]["instructor"] = mbox("instructor").to_agent();
        }
    }

    Statement::from_value(value)
        .unwrap()
        .with_authority(&corpus_authority(i))
        .with_stored(corpus_timestamp(i))
}

/// All query vectors.
pub fn all_query_vectors() -> Vec<QueryVector> {
    vec![
        QueryVector {
            name: "everything, newest first",
            query: ReadQuery::default(),
        },
        QueryVector {
            name: "everything, oldest first",
            query: ReadQuery {
                ascending: true,
                ..ReadQuery::default()
            },
        },
        QueryVector {
            name: "single id",
            query: ReadQuery::by_id(corpus_key(5)),
        },
        QueryVector {
            name: "verb",
            query: ReadQuery::by_verb(COMPLETED),
        },
        QueryVector {
            name: "actor",
            query: ReadQuery {
                agent: Some(mbox("learner-1")),
                ..ReadQuery::default()
            },
        },
        QueryVector {
            name: "related agents",
            query: ReadQuery {
                agent: Some(mbox("instructor")),
                related_agents: true,
                ..ReadQuery::default()
            },
        },
        QueryVector {
            name: "agent as object",
            query: ReadQuery {
                agent: Some(mbox("learner-0")),
                related_agents: true,
                ascending: true,
                ..ReadQuery::default()
            },
        },
        QueryVector {
            name: "activity",
            query: ReadQuery {
                activity: Some(activity("course-2")),
                ..ReadQuery::default()
            },
        },
        QueryVector {
            name: "related activities",
            query: ReadQuery {
                activity: Some(activity("module-1")),
                related_activities: true,
                ..ReadQuery::default()
            },
        },
        QueryVector {
            name: "registration",
            query: ReadQuery {
                registration: Some(REGISTRATION),
                ..ReadQuery::default()
            },
        },
        QueryVector {
            name: "time window",
            query: ReadQuery {
                since: Some(corpus_timestamp(6)),
                until: Some(corpus_timestamp(24)),
                ascending: true,
                ..ReadQuery::default()
            },
        },
        QueryVector {
            name: "authority",
            query: ReadQuery::default().with_authority(Some(corpus_authority(0))),
        },
        QueryVector {
            name: "resume descending",
            query: ReadQuery::default().after(Some(CursorPosition::new(
                corpus_timestamp(20),
                corpus_key(20),
            ))),
        },
        QueryVector {
            name: "resume ascending",
            query: ReadQuery {
                ascending: true,
                ..ReadQuery::default()
            }
            .after(Some(CursorPosition::new(corpus_timestamp(11), corpus_key(11)))),
        },
        QueryVector {
            name: "combined filters",
            query: ReadQuery {
                verb: Some(EXPERIENCED.to_string()),
                registration: Some(REGISTRATION),
                since: Some(corpus_timestamp(2)),
                ascending: true,
                ..ReadQuery::default()
            }
            .with_authority(Some(corpus_authority(0))),
        },
        QueryVector {
            name: "voids of listed ids",
            query: ReadQuery::voiding([corpus_key(3), corpus_key(8)]),
        },
        QueryVector {
            name: "no match",
            query: ReadQuery::by_verb("http://example.com/verbs/never"),
        },
    ]
}
