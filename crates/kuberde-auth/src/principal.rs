//! Verified actors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::authz::{ADMIN_ROLE, AGENT_ROLE, SYSTEM_ROLE};

/// What kind of actor a credential belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    /// A person, via the CLI or a browser
    User,
    /// An in-pod agent using client credentials
    Agent,
    /// The controller or another platform component
    System,
}

/// The result of verifying a credential
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable subject id from the `sub` claim
    pub subject: String,
    /// `preferred_username`, or the subject when absent
    pub username: String,
    /// Realm roles
    pub roles: Vec<String>,
    /// When the credential stops being valid
    pub expires_at: DateTime<Utc>,
    /// Key of the server-side session record this token maps to
    pub session_key: String,
}

impl Principal {
    /// Whether the principal carries `role`
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Admins and the system identity may act on any agent
    pub fn is_administrative(&self) -> bool {
        self.has_role(ADMIN_ROLE) || self.has_role(SYSTEM_ROLE)
    }

    /// Actor kind inferred from roles
    pub fn kind(&self) -> ActorKind {
        if self.has_role(SYSTEM_ROLE) {
            ActorKind::System
        } else if self.has_role(AGENT_ROLE) {
            ActorKind::Agent
        } else {
            ActorKind::User
        }
    }

    /// Whether the credential has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
