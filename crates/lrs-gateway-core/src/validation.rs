//! Query validation and the record-validation collaborator.

use std::fmt;

use serde_json::Value;

use crate::error::ValidationError;
use crate::query::StatementQuery;
use crate::statement::{parse_timestamp, Statement, VOIDED_VERB};
use crate::types::IdentityKey;

/// Validate a caller query before it reaches any translator.
///
/// - `statement_id` and `voided_statement_id` cannot both be set.
/// - Either of them excludes every other filter, the cursor, a non-zero
///   limit and ascending order.
/// - `since` must not be after `until`.
pub fn validate_query(query: &StatementQuery) -> Result<(), ValidationError> {
    let identity = match (&query.statement_id, &query.voided_statement_id) {
        (Some(_), Some(_)) => return Err(ValidationError::ConflictingIdentityFilters),
        (Some(_), None) => Some("statement_id"),
        (None, Some(_)) => Some("voided_statement_id"),
        (None, None) => None,
    };

    if let Some(identity) = identity {
        let others: [(&'static str, bool); 11] = [
            ("agent", query.agent.is_some()),
            ("verb", query.verb.is_some()),
            ("activity", query.activity.is_some()),
            ("registration", query.registration.is_some()),
            ("related_activities", query.related_activities),
            ("related_agents", query.related_agents),
            ("since", query.since.is_some()),
            ("until", query.until.is_some()),
            ("limit", query.limit != 0),
            ("ascending", query.ascending),
            ("cursor", query.cursor.is_some()),
        ];
        if let Some(&(field, _)) = others.iter().find(|(_, set)| *set) {
            return Err(ValidationError::ExclusiveFilter { identity, field });
        }
    }

    if let (Some(since), Some(until)) = (query.since, query.until) {
        if since > until {
            return Err(ValidationError::InvertedTimeRange {
                since: since.to_rfc3339(),
                until: until.to_rfc3339(),
            });
        }
    }

    Ok(())
}

/// Why a raw record was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectionReason(pub String);

impl RejectionReason {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Turns raw input into a validated statement or a rejection.
///
/// The store calls this once per submitted record and never again for
/// statements it constructs itself (identity and authority stamping).
pub trait RecordValidator: Send + Sync {
    fn validate(&self, raw: Value) -> Result<Statement, RejectionReason>;
}

/// Minimal structural checks.
///
/// This is not a full schema validator. It guarantees the fields the store
/// relies on are well formed:
/// - the record is an object with `actor`, `verb.id` and `object`,
/// - `id`, when present, is a UUID,
/// - `timestamp`, when present, is RFC 3339,
/// - a voiding statement references a statement by UUID.
#[derive(Clone, Copy, Debug, Default)]
pub struct StructuralValidator;

impl RecordValidator for StructuralValidator {
    fn validate(&self, raw: Value) -> Result<Statement, RejectionReason> {
        let statement =
            Statement::from_value(raw).map_err(|e| RejectionReason::new(e.to_string()))?;

        for field in ["actor", "object"] {
            if !statement.get(field).map(Value::is_object).unwrap_or(false) {
                return Err(RejectionReason::new(format!("{field} must be an object")));
            }
        }

        if statement.verb_id().is_none() {
            return Err(RejectionReason::new("verb.id is required"));
        }

        if let Some(id) = statement.get("id") {
            let valid = id
                .as_str()
                .map(|s| IdentityKey::parse(s).is_ok())
                .unwrap_or(false);
            if !valid {
                return Err(RejectionReason::new("id must be a UUID"));
            }
        }

        if let Some(timestamp) = statement.get("timestamp") {
            if timestamp.as_str().and_then(parse_timestamp).is_none() {
                return Err(RejectionReason::new("timestamp must be RFC 3339"));
            }
        }

        if statement.verb_id() == Some(VOIDED_VERB) && statement.voided_target().is_none() {
            return Err(RejectionReason::new(
                "a voiding statement must reference a StatementRef by id",
            ));
        }

        Ok(statement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Ifi;
    use crate::cursor::Cursor;
    use chrono::{Duration, Utc};
    use serde_json::json;

    #[test]
    fn test_identity_excludes_agent() {
        let query = StatementQuery {
            statement_id: Some(IdentityKey::generate()),
            agent: Some(Ifi::Mbox("mailto:a@example.com".into())),
            ..StatementQuery::default()
        };
        assert_eq!(
            validate_query(&query),
            Err(ValidationError::ExclusiveFilter {
                identity: "statement_id",
                field: "agent"
            })
        );
    }

    #[test]
    fn test_voided_identity_excludes_cursor() {
        let query = StatementQuery {
            voided_statement_id: Some(IdentityKey::generate()),
            cursor: Some(Cursor::new("00")),
            ..StatementQuery::default()
        };
        assert!(matches!(
            validate_query(&query),
            Err(ValidationError::ExclusiveFilter { field: "cursor", .. })
        ));
    }

    #[test]
    fn test_both_identities_rejected() {
        let query = StatementQuery {
            statement_id: Some(IdentityKey::generate()),
            voided_statement_id: Some(IdentityKey::generate()),
            ..StatementQuery::default()
        };
        assert_eq!(
            validate_query(&query),
            Err(ValidationError::ConflictingIdentityFilters)
        );
    }

    #[test]
    fn test_identity_alone_and_mine_are_valid() {
        let query = StatementQuery {
            mine: true,
            ..StatementQuery::by_id(IdentityKey::generate())
        };
        assert!(validate_query(&query).is_ok());
    }

    #[test]
    fn test_inverted_time_range() {
        let now = Utc::now();
        let query = StatementQuery {
            since: Some(now),
            until: Some(now - Duration::seconds(1)),
            ..StatementQuery::default()
        };
        assert!(matches!(
            validate_query(&query),
            Err(ValidationError::InvertedTimeRange { .. })
        ));
    }

    #[test]
    fn test_structural_validator_accepts_minimal_statement() {
        let raw = json!({
            "actor": { "mbox": "mailto:a@example.com" },
            "verb": { "id": "http://adlnet.gov/expapi/verbs/experienced" },
            "object": { "id": "http://example.com/page" }
        });
        assert!(StructuralValidator.validate(raw).is_ok());
    }

    #[test]
    fn test_structural_validator_rejections() {
        let base = json!({
            "actor": { "mbox": "mailto:a@example.com" },
            "verb": { "id": "http://adlnet.gov/expapi/verbs/experienced" },
            "object": { "id": "http://example.com/page" }
        });

        let mut bad_id = base.clone();
        bad_id["id"] = json!("42");
        assert!(StructuralValidator.validate(bad_id).is_err());

        let mut bad_ts = base.clone();
        bad_ts["timestamp"] = json!("yesterday");
        assert!(StructuralValidator.validate(bad_ts).is_err());

        let mut no_verb = base.clone();
        no_verb.as_object_mut().unwrap().remove("verb");
        assert!(StructuralValidator.validate(no_verb).is_err());

        let mut bad_void = base;
        bad_void["verb"]["id"] = json!(VOIDED_VERB);
        assert!(StructuralValidator.validate(bad_void).is_err());

        assert!(StructuralValidator.validate(json!([])).is_err());
    }
}
