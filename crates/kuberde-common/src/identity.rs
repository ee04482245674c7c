//! Agent identities
//!
//! An identity is the join key between the operator, the relay's routing
//! table, and the agent's session: `user-{owner}-{workload}[-{service}]`.
//! The workload form names the agent session and the Deployment; the
//! per-service form names route targets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Prefix shared by every user-owned identity
pub const IDENTITY_PREFIX: &str = "user-";

/// Maximum identity length (Kubernetes object name limit)
pub const MAX_IDENTITY_LEN: usize = 253;

/// Stable key identifying one agent's routable endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentIdentity(String);

impl AgentIdentity {
    /// Identity of a workload's agent session: `user-{owner}-{workload}`
    pub fn for_workload(owner: &str, workload: &str) -> Self {
        Self(format!("{IDENTITY_PREFIX}{owner}-{workload}"))
    }

    /// Per-service identity derived from a workload identity
    pub fn for_service(&self, service: &str) -> Self {
        Self(format!("{}-{}", self.0, service))
    }

    /// Parse and validate an identity string
    ///
    /// Accepts lowercase alphanumerics and `-`, must start and end with an
    /// alphanumeric, and must fit in a Kubernetes object name.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if raw.is_empty() || raw.len() > MAX_IDENTITY_LEN {
            return Err(Error::validation(format!(
                "agent identity must be 1-{MAX_IDENTITY_LEN} characters"
            )));
        }
        let valid_chars = raw
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        let valid_edges = !raw.starts_with('-') && !raw.ends_with('-');
        if !valid_chars || !valid_edges {
            return Err(Error::validation(format!(
                "invalid agent identity '{raw}': expected lowercase alphanumerics and '-'"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// The identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Owner embedded in a `user-{owner}-...` identity
    ///
    /// Owners never contain `-`, so the owner is the segment between the
    /// prefix and the next dash. Identities without the prefix have no owner.
    pub fn owner(&self) -> Option<&str> {
        let rest = self.0.strip_prefix(IDENTITY_PREFIX)?;
        let owner = rest.split('-').next()?;
        (!owner.is_empty()).then_some(owner)
    }

    /// Identity of the session that serves a per-service route target
    ///
    /// `user-alice-ws-ssh` with service `ssh` resolves to `user-alice-ws`.
    /// Targets that already name the workload are returned unchanged.
    pub fn session_identity(&self, service: &str) -> Self {
        let suffix = format!("-{service}");
        match self.0.strip_suffix(&suffix) {
            Some(base) if !base.is_empty() => Self(base.to_string()),
            _ => self.clone(),
        }
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AgentIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AgentIdentity {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AgentIdentity> for String {
    fn from(id: AgentIdentity) -> Self {
        id.0
    }
}

impl AsRef<str> for AgentIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_and_service_identities_compose() {
        let ws = AgentIdentity::for_workload("alice", "ws");
        assert_eq!(ws.as_str(), "user-alice-ws");
        assert_eq!(ws.for_service("ssh").as_str(), "user-alice-ws-ssh");
    }

    #[test]
    fn owner_is_parsed_from_identity() {
        let id = AgentIdentity::parse("user-alice-my-workspace-files").unwrap();
        assert_eq!(id.owner(), Some("alice"));
    }

    #[test]
    fn identities_without_prefix_have_no_owner() {
        let id = AgentIdentity::parse("default-agent").unwrap();
        assert_eq!(id.owner(), None);
    }

    #[test]
    fn session_identity_strips_service_suffix() {
        let id = AgentIdentity::parse("user-alice-ws-ssh").unwrap();
        assert_eq!(id.session_identity("ssh").as_str(), "user-alice-ws");
        // A target already naming the workload stays as-is
        let ws = AgentIdentity::parse("user-alice-ws").unwrap();
        assert_eq!(ws.session_identity("ssh"), ws);
    }

    #[test]
    fn invalid_identities_are_rejected() {
        assert!(AgentIdentity::parse("").is_err());
        assert!(AgentIdentity::parse("User-Alice").is_err());
        assert!(AgentIdentity::parse("-leading").is_err());
        assert!(AgentIdentity::parse("trailing-").is_err());
        assert!(AgentIdentity::parse("has space").is_err());
        assert!(AgentIdentity::parse(&"a".repeat(MAX_IDENTITY_LEN + 1)).is_err());
    }

    #[test]
    fn identity_round_trips_through_serde_as_string() {
        let id = AgentIdentity::for_workload("bob", "lab");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"user-bob-lab\"");
        let back: AgentIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<AgentIdentity>("\"Bad Id\"").is_err());
    }
}
