//! The authenticated caller and its scopes.
//!
//! Credential checking happens outside the gateway; the store receives an
//! already-resolved [`Principal`] with every request.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::agent::Authority;
use crate::error::ValidationError;

/// An access scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Scope {
    #[serde(rename = "statements/write")]
    StatementsWrite,
    #[serde(rename = "statements/read/mine")]
    StatementsReadMine,
    #[serde(rename = "statements/read")]
    StatementsRead,
    #[serde(rename = "all/read")]
    AllRead,
    #[serde(rename = "all")]
    All,
}

impl Scope {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Scope::StatementsWrite => "statements/write",
            Scope::StatementsReadMine => "statements/read/mine",
            Scope::StatementsRead => "statements/read",
            Scope::AllRead => "all/read",
            Scope::All => "all",
        }
    }

    /// The scopes this one grants, itself included.
    pub fn expand(&self) -> &'static [Scope] {
        use Scope::*;
        match self {
            StatementsWrite => &[StatementsWrite],
            StatementsReadMine => &[StatementsReadMine],
            StatementsRead => &[StatementsRead, StatementsReadMine],
            AllRead => &[AllRead, StatementsRead, StatementsReadMine],
            All => &[All, AllRead, StatementsRead, StatementsReadMine, StatementsWrite],
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "statements/write" => Ok(Scope::StatementsWrite),
            "statements/read/mine" => Ok(Scope::StatementsReadMine),
            "statements/read" => Ok(Scope::StatementsRead),
            "all/read" => Ok(Scope::AllRead),
            "all" => Ok(Scope::All),
            other => Err(ValidationError::UnknownScope(other.to_string())),
        }
    }
}

/// A resolved caller: identity, the authority its writes are stamped with,
/// and its granted scopes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub authority: Authority,
    pub scopes: BTreeSet<Scope>,
}

impl Principal {
    pub fn new(
        id: impl Into<String>,
        authority: Authority,
        scopes: impl IntoIterator<Item = Scope>,
    ) -> Self {
        Self {
            id: id.into(),
            authority,
            scopes: scopes.into_iter().collect(),
        }
    }

    /// Is `scope` granted directly or through expansion?
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.iter().any(|granted| granted.expand().contains(&scope))
    }

    /// May this principal read statements written under other authorities?
    pub fn reads_unrestricted(&self) -> bool {
        self.has_scope(Scope::StatementsRead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Ifi;

    fn principal(scopes: &[Scope]) -> Principal {
        Principal::new(
            "client",
            Authority::new(Ifi::Mbox("mailto:client@example.com".into())),
            scopes.iter().copied(),
        )
    }

    #[test]
    fn test_scope_expansion() {
        let all = principal(&[Scope::All]);
        assert!(all.has_scope(Scope::StatementsWrite));
        assert!(all.reads_unrestricted());

        let all_read = principal(&[Scope::AllRead]);
        assert!(all_read.has_scope(Scope::StatementsReadMine));
        assert!(!all_read.has_scope(Scope::StatementsWrite));

        let mine = principal(&[Scope::StatementsReadMine]);
        assert!(mine.has_scope(Scope::StatementsReadMine));
        assert!(!mine.reads_unrestricted());
    }

    #[test]
    fn test_scope_parse_and_serde() {
        assert_eq!("all/read".parse::<Scope>().unwrap(), Scope::AllRead);
        assert!("statements/delete".parse::<Scope>().is_err());
        let json = serde_json::to_string(&Scope::StatementsReadMine).unwrap();
        assert_eq!(json, "\"statements/read/mine\"");
    }
}
