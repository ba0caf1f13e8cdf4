//! Test fixtures and helpers.
//!
//! Builders for raw statements, stamped statements and principals.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};

use lrs_gateway_core::{
    format_timestamp, Authority, IdentityKey, Ifi, Principal, Scope, Statement, VOIDED_VERB,
};

pub const EXPERIENCED: &str = "http://adlnet.gov/expapi/verbs/experienced";
pub const COMPLETED: &str = "http://adlnet.gov/expapi/verbs/completed";
pub const ATTEMPTED: &str = "http://adlnet.gov/expapi/verbs/attempted";

/// `mailto:` identifier for a short name.
pub fn mbox(name: &str) -> Ifi {
    Ifi::Mbox(format!("mailto:{name}@example.com"))
}

/// A principal whose authority is `mbox(name)`.
pub fn principal(name: &str, scopes: impl IntoIterator<Item = Scope>) -> Principal {
    Principal::new(name, Authority::new(mbox(name)), scopes)
}

/// A principal holding every scope.
pub fn admin() -> Principal {
    principal("admin", [Scope::All])
}

/// Activity IRI for a short name.
pub fn activity(name: &str) -> String {
    format!("http://example.com/activities/{name}")
}

/// Builds raw statements for one actor with timestamps spaced one second
/// apart from a fixed base.
#[derive(Debug, Clone)]
pub struct StatementFactory {
    actor: Ifi,
    base: DateTime<Utc>,
}

impl StatementFactory {
    pub fn new() -> Self {
        Self::for_actor(mbox("learner"))
    }

    pub fn for_actor(actor: Ifi) -> Self {
        Self {
            actor,
            base: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
        }
    }

    pub fn actor(&self) -> &Ifi {
        &self.actor
    }

    /// Timestamp of the `seq`-th statement.
    pub fn at(&self, seq: i64) -> DateTime<Utc> {
        self.base + Duration::seconds(seq)
    }

    /// A statement without an id.
    pub fn raw(&self, verb: &str, object: &str, seq: i64) -> Value {
        json!({
            "actor": self.actor.to_agent(),
            "verb": { "id": verb },
            "object": { "objectType": "Activity", "id": object },
            "timestamp": format_timestamp(&self.at(seq)),
        })
    }

    /// A statement with a fresh id.
    pub fn identified(&self, verb: &str, object: &str, seq: i64) -> Value {
        let mut value = self.raw(verb, object, seq);
        value["id"] = json!(IdentityKey::generate().to_string());
        value
    }

    /// An `experienced` statement on page `seq`, with a fresh id.
    pub fn experienced(&self, seq: i64) -> Value {
        self.identified(EXPERIENCED, &activity(&format!("page-{seq}")), seq)
    }

    /// A statement voiding `target`, with a fresh id.
    pub fn voiding(&self, target: IdentityKey, seq: i64) -> Value {
        json!({
            "id": IdentityKey::generate().to_string(),
            "actor": self.actor.to_agent(),
            "verb": { "id": VOIDED_VERB },
            "object": { "objectType": "StatementRef", "id": target.to_string() },
            "timestamp": format_timestamp(&self.at(seq)),
        })
    }

    /// `n` experienced statements, oldest first.
    pub fn batch(&self, n: usize) -> Vec<Value> {
        (0..n as i64).map(|seq| self.experienced(seq)).collect()
    }

    /// A statement as the store would persist it: stamped with `authority`
    /// and a `stored` time.
    pub fn stamped(&self, value: Value, authority: &Authority) -> Statement {
        let statement = Statement::from_value(value).unwrap();
        let stored = statement.timestamp().unwrap_or(self.base);
        statement.with_authority(authority).with_stored(stored)
    }
}

impl Default for StatementFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity key of a raw statement built by [`StatementFactory`].
pub fn key_of(value: &Value) -> IdentityKey {
    IdentityKey::parse(value["id"].as_str().unwrap()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_timestamps_are_spaced() {
        let factory = StatementFactory::new();
        let batch = factory.batch(3);
        let first = Statement::from_value(batch[0].clone()).unwrap();
        let last = Statement::from_value(batch[2].clone()).unwrap();
        assert_eq!(last.timestamp().unwrap() - first.timestamp().unwrap(), Duration::seconds(2));
    }

    #[test]
    fn test_voiding_targets_key() {
        let factory = StatementFactory::new();
        let target = IdentityKey::generate();
        let voiding = Statement::from_value(factory.voiding(target, 1)).unwrap();
        assert!(voiding.is_voiding());
        assert_eq!(voiding.voided_target(), Some(target));
    }

    #[test]
    fn test_stamped_carries_authority() {
        let factory = StatementFactory::new();
        let who = principal("client", [Scope::StatementsWrite]);
        let statement = factory.stamped(factory.experienced(0), &who.authority);
        assert_eq!(statement.authority(), Some(who.authority));
        assert!(statement.stored().is_some());
    }
}
