//! The statement: one immutable learning-event record.
//!
//! A [`Statement`] is an opaque JSON object. The gateway reads a handful of
//! well-known fields from it (id, verb, object, timestamp, authority) and
//! stamps server-assigned fields before it is persisted. After that it is
//! never modified; retraction happens through a separate voiding statement.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agent::{Authority, Ifi};
use crate::canonical::canonical_json;
use crate::error::ValidationError;
use crate::types::{ContentDigest, IdentityKey};

/// Verb marking a statement as voiding another one.
pub const VOIDED_VERB: &str = "http://adlnet.gov/expapi/verbs/voided";

/// Agent positions searched when a query asks for related agents.
///
/// The `object.*` entries reach into a SubStatement object.
pub const RELATED_AGENT_PATHS: &[&[&str]] = &[
    &["actor"],
    &["object"],
    &["authority"],
    &["context", "instructor"],
    &["context", "team"],
    &["object", "actor"],
    &["object", "object"],
    &["object", "context", "instructor"],
    &["object", "context", "team"],
];

/// Keys under `contextActivities`.
pub const CONTEXT_ACTIVITY_KINDS: &[&str] = &["parent", "grouping", "category", "other"];

/// Context roots searched for related activities: the statement's own
/// context and that of a SubStatement object.
pub const RELATED_CONTEXT_ROOTS: &[&[&str]] = &[&["context"], &["object", "context"]];

/// Fields assigned by the store, excluded when comparing content.
const SERVER_FIELDS: &[&str] = &["stored", "authority"];

/// A validated statement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Statement(Map<String, Value>);

impl Statement {
    /// Wrap a JSON value. Fails unless the value is an object.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(ValidationError::MalformedStatement(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Top-level field lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Nested field lookup by key path.
    pub fn pointer(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        rest.iter().try_fold(self.0.get(*first)?, |node, key| node.get(key))
    }

    /// Nested string field lookup.
    pub fn str_at(&self, path: &[&str]) -> Option<&str> {
        self.pointer(path).and_then(Value::as_str)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Well-known fields
    // ─────────────────────────────────────────────────────────────────────────

    /// The statement id, if present and a valid UUID.
    pub fn id(&self) -> Option<IdentityKey> {
        self.str_at(&["id"]).and_then(|s| IdentityKey::parse(s).ok())
    }

    /// The statement id, required.
    pub fn require_id(&self) -> Result<IdentityKey, ValidationError> {
        self.id()
            .ok_or_else(|| ValidationError::MalformedStatement("missing or invalid id".into()))
    }

    pub fn verb_id(&self) -> Option<&str> {
        self.str_at(&["verb", "id"])
    }

    pub fn object_type(&self) -> Option<&str> {
        self.str_at(&["object", "objectType"])
    }

    /// Is this a voiding statement?
    pub fn is_voiding(&self) -> bool {
        self.verb_id() == Some(VOIDED_VERB) && self.object_type() == Some("StatementRef")
    }

    /// The statement this one voids, if it is a voiding statement.
    pub fn voided_target(&self) -> Option<IdentityKey> {
        if !self.is_voiding() {
            return None;
        }
        self.str_at(&["object", "id"])
            .and_then(|s| IdentityKey::parse(s).ok())
    }

    pub fn has_timestamp(&self) -> bool {
        self.0.contains_key("timestamp")
    }

    /// The statement timestamp, if present and RFC 3339.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.str_at(&["timestamp"]).and_then(parse_timestamp)
    }

    /// The statement timestamp, required.
    pub fn require_timestamp(&self) -> Result<DateTime<Utc>, ValidationError> {
        self.timestamp().ok_or_else(|| {
            ValidationError::MalformedStatement("missing or invalid timestamp".into())
        })
    }

    pub fn stored(&self) -> Option<DateTime<Utc>> {
        self.str_at(&["stored"]).and_then(parse_timestamp)
    }

    pub fn authority(&self) -> Option<Authority> {
        self.get("authority").and_then(Authority::from_agent)
    }

    pub fn actor(&self) -> Option<Ifi> {
        self.get("actor").and_then(Ifi::from_agent)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Server-side stamping
    // ─────────────────────────────────────────────────────────────────────────

    pub fn with_id(mut self, key: IdentityKey) -> Self {
        self.0.insert("id".into(), Value::String(key.to_string()));
        self
    }

    pub fn with_authority(mut self, authority: &Authority) -> Self {
        self.0.insert("authority".into(), authority.to_agent());
        self
    }

    pub fn with_stored(mut self, stored: DateTime<Utc>) -> Self {
        self.0
            .insert("stored".into(), Value::String(format_timestamp(&stored)));
        self
    }

    /// Set `timestamp` unless the statement already carries one.
    pub fn with_default_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.0
            .entry("timestamp")
            .or_insert_with(|| Value::String(format_timestamp(&timestamp)));
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Content comparison
    // ─────────────────────────────────────────────────────────────────────────

    /// Digest of the caller-controlled content.
    ///
    /// Server-assigned fields are skipped. When `skip_timestamp` is set the
    /// timestamp is skipped as well, for comparing against a submission
    /// whose timestamp was filled in by the server.
    pub fn content_digest(&self, skip_timestamp: bool) -> ContentDigest {
        let mut map = self.0.clone();
        for field in SERVER_FIELDS {
            map.remove(*field);
        }
        if skip_timestamp {
            map.remove("timestamp");
        }
        ContentDigest::hash(&canonical_json(&Value::Object(map)))
    }

    /// Does `other` (as submitted, before stamping) carry the same content
    /// as this stored statement?
    pub fn same_content(&self, submitted: &Statement) -> bool {
        let skip_timestamp = !submitted.has_timestamp();
        self.content_digest(skip_timestamp) == submitted.content_digest(skip_timestamp)
    }
}

impl TryFrom<Value> for Statement {
    type Error = ValidationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Statement> for Value {
    fn from(statement: Statement) -> Self {
        statement.into_value()
    }
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Format a timestamp as RFC 3339 in UTC, keeping sub-second precision.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample() -> Statement {
        Statement::from_value(json!({
            "id": "3b6d3c4e-5f1a-4c8b-9d2e-7a6b5c4d3e2f",
            "actor": { "mbox": "mailto:learner@example.com" },
            "verb": { "id": "http://adlnet.gov/expapi/verbs/completed" },
            "object": { "id": "http://example.com/course/1" },
            "timestamp": "2024-03-01T10:00:00.123456789Z"
        }))
        .unwrap()
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(Statement::from_value(json!([1, 2])).is_err());
        assert!(Statement::from_value(json!("text")).is_err());
    }

    #[test]
    fn test_well_known_fields() {
        let s = sample();
        assert_eq!(
            s.id().unwrap().to_string(),
            "3b6d3c4e-5f1a-4c8b-9d2e-7a6b5c4d3e2f"
        );
        assert_eq!(s.verb_id(), Some("http://adlnet.gov/expapi/verbs/completed"));
        assert_eq!(s.timestamp().unwrap().timestamp_subsec_nanos(), 123_456_789);
        assert_eq!(s.actor(), Some(Ifi::Mbox("mailto:learner@example.com".into())));
        assert!(!s.is_voiding());
    }

    #[test]
    fn test_voiding_detection() {
        let voiding = Statement::from_value(json!({
            "actor": { "mbox": "mailto:admin@example.com" },
            "verb": { "id": VOIDED_VERB },
            "object": { "objectType": "StatementRef", "id": "3b6d3c4e-5f1a-4c8b-9d2e-7a6b5c4d3e2f" }
        }))
        .unwrap();
        assert!(voiding.is_voiding());
        assert_eq!(voiding.voided_target(), sample().id());

        let not_a_ref = Statement::from_value(json!({
            "verb": { "id": VOIDED_VERB },
            "object": { "id": "http://example.com/activity" }
        }))
        .unwrap();
        assert!(!not_a_ref.is_voiding());
        assert_eq!(not_a_ref.voided_target(), None);
    }

    #[test]
    fn test_stamping_preserves_existing_timestamp() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let stamped = sample().with_default_timestamp(now).with_stored(now);
        assert_eq!(stamped.str_at(&["timestamp"]), Some("2024-03-01T10:00:00.123456789Z"));
        assert_eq!(stamped.stored(), Some(now));
    }

    #[test]
    fn test_same_content_ignores_server_fields() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let authority = Authority::new(Ifi::Mbox("mailto:lrs@example.com".into()));
        let stored = sample().with_authority(&authority).with_stored(now);
        assert!(stored.same_content(&sample()));

        let mut changed = sample().into_value();
        changed["verb"]["id"] = json!("http://adlnet.gov/expapi/verbs/failed");
        assert!(!stored.same_content(&Statement::from_value(changed).unwrap()));
    }

    #[test]
    fn test_same_content_with_server_default_timestamp() {
        let mut raw = sample().into_value();
        raw.as_object_mut().unwrap().remove("timestamp");
        let submitted = Statement::from_value(raw).unwrap();

        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let stored = submitted.clone().with_default_timestamp(now).with_stored(now);
        assert!(stored.same_content(&submitted));
    }

    #[test]
    fn test_format_timestamp_keeps_nanos() {
        let ts = parse_timestamp("2024-03-01T10:00:00.000000001+02:00").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-01T08:00:00.000000001Z");
    }
}
