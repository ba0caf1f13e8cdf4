//! Agent identification: inverse functional identifiers and authority.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const MBOX: &[&str] = &["mbox"];
const MBOX_SHA1SUM: &[&str] = &["mbox_sha1sum"];
const OPENID: &[&str] = &["openid"];
const ACCOUNT_NAME: &[&str] = &["account", "name"];
const ACCOUNT_HOME_PAGE: &[&str] = &["account", "homePage"];

/// An inverse functional identifier: the one property that uniquely
/// identifies an agent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ifi {
    /// `mailto:` IRI.
    Mbox(String),
    /// Hex SHA-1 of a `mailto:` IRI.
    MboxSha1sum(String),
    OpenId(String),
    Account { home_page: String, name: String },
}

impl Ifi {
    /// Extract the identifier of an agent object, if it carries one.
    ///
    /// When several are present the first of `mbox`, `mbox_sha1sum`,
    /// `openid`, `account` wins.
    pub fn from_agent(agent: &Value) -> Option<Self> {
        let text = |key: &str| agent.get(key).and_then(Value::as_str).map(str::to_string);

        if let Some(mbox) = text("mbox") {
            return Some(Ifi::Mbox(mbox));
        }
        if let Some(sum) = text("mbox_sha1sum") {
            return Some(Ifi::MboxSha1sum(sum));
        }
        if let Some(openid) = text("openid") {
            return Some(Ifi::OpenId(openid));
        }
        let account = agent.get("account")?;
        Some(Ifi::Account {
            home_page: account.get("homePage")?.as_str()?.to_string(),
            name: account.get("name")?.as_str()?.to_string(),
        })
    }

    /// Render as a minimal agent object.
    pub fn to_agent(&self) -> Value {
        match self {
            Ifi::Mbox(v) => json!({ "objectType": "Agent", "mbox": v }),
            Ifi::MboxSha1sum(v) => json!({ "objectType": "Agent", "mbox_sha1sum": v }),
            Ifi::OpenId(v) => json!({ "objectType": "Agent", "openid": v }),
            Ifi::Account { home_page, name } => json!({
                "objectType": "Agent",
                "account": { "homePage": home_page, "name": name }
            }),
        }
    }

    /// Field paths (relative to the agent object) and the values they must
    /// equal for an agent to carry this identifier.
    pub fn field_pairs(&self) -> Vec<(&'static [&'static str], &str)> {
        match self {
            Ifi::Mbox(v) => vec![(MBOX, v.as_str())],
            Ifi::MboxSha1sum(v) => vec![(MBOX_SHA1SUM, v.as_str())],
            Ifi::OpenId(v) => vec![(OPENID, v.as_str())],
            Ifi::Account { home_page, name } => vec![
                (ACCOUNT_NAME, name.as_str()),
                (ACCOUNT_HOME_PAGE, home_page.as_str()),
            ],
        }
    }

    /// Does the given agent object carry this identifier?
    pub fn matches(&self, agent: &Value) -> bool {
        self.field_pairs().iter().all(|(path, expected)| {
            path.iter()
                .try_fold(agent, |node, key| node.get(key))
                .and_then(Value::as_str)
                == Some(*expected)
        })
    }

    /// Canonical single-string form, used as a flat index column.
    pub fn canonical(&self) -> String {
        match self {
            Ifi::Mbox(v) => format!("mbox:{v}"),
            Ifi::MboxSha1sum(v) => format!("mbox_sha1sum:{v}"),
            Ifi::OpenId(v) => format!("openid:{v}"),
            Ifi::Account { home_page, name } => format!("account:{home_page}|{name}"),
        }
    }
}

impl fmt::Display for Ifi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// The identity stamped on a statement at write time, derived from the
/// writing principal. Immutable once written.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Authority(pub Ifi);

impl Authority {
    pub fn new(ifi: Ifi) -> Self {
        Self(ifi)
    }

    /// Read the authority recorded on a statement's `authority` agent.
    pub fn from_agent(agent: &Value) -> Option<Self> {
        Ifi::from_agent(agent).map(Self)
    }

    pub fn ifi(&self) -> &Ifi {
        &self.0
    }

    pub fn to_agent(&self) -> Value {
        self.0.to_agent()
    }

    pub fn canonical(&self) -> String {
        self.0.canonical()
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifi_from_agent_precedence() {
        let agent = json!({ "mbox": "mailto:a@example.com", "openid": "https://id" });
        assert_eq!(
            Ifi::from_agent(&agent),
            Some(Ifi::Mbox("mailto:a@example.com".into()))
        );
    }

    #[test]
    fn test_ifi_account_roundtrip_through_agent() {
        let ifi = Ifi::Account {
            home_page: "https://lms.example.com".into(),
            name: "learner-1".into(),
        };
        let agent = ifi.to_agent();
        assert_eq!(Ifi::from_agent(&agent), Some(ifi.clone()));
        assert!(ifi.matches(&agent));
    }

    #[test]
    fn test_ifi_matches_requires_all_fields() {
        let ifi = Ifi::Account {
            home_page: "https://lms.example.com".into(),
            name: "learner-1".into(),
        };
        let other = json!({ "account": { "homePage": "https://lms.example.com", "name": "x" } });
        assert!(!ifi.matches(&other));
        assert!(!ifi.matches(&json!({})));
    }

    #[test]
    fn test_agent_without_ifi() {
        assert_eq!(Ifi::from_agent(&json!({ "name": "anonymous" })), None);
        assert_eq!(Ifi::from_agent(&json!({ "account": { "name": "x" } })), None);
    }
}
