//! Ownership checks
//!
//! A principal may act on an agent identity when it is administrative or
//! when the identity's embedded owner is the principal's username. Session
//! admission additionally accepts the machine agent role.

use kuberde_common::AgentIdentity;

use crate::{AuthError, Principal};

/// Realm role for platform administrators
pub const ADMIN_ROLE: &str = "admin";

/// Realm role carried by the controller's system identity
pub const SYSTEM_ROLE: &str = "kuberde-system";

/// Realm role carried by in-pod agents
pub const AGENT_ROLE: &str = "kuberde-agent";

/// Whether `principal` may act on `identity`
pub fn can_act_on(principal: &Principal, identity: &AgentIdentity) -> bool {
    principal.is_administrative() || identity.owner() == Some(principal.username.as_str())
}

/// [`can_act_on`] as a `Result`
pub fn authorize(principal: &Principal, identity: &AgentIdentity) -> Result<(), AuthError> {
    if can_act_on(principal, identity) {
        Ok(())
    } else {
        Err(AuthError::forbidden(&principal.username, identity.as_str()))
    }
}

/// Whether `principal` may hold the tunnel session for `identity`
pub fn authorize_session(principal: &Principal, identity: &AgentIdentity) -> Result<(), AuthError> {
    if principal.has_role(AGENT_ROLE) {
        return Ok(());
    }
    authorize(principal, identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::fixtures::principal;

    fn id(raw: &str) -> AgentIdentity {
        AgentIdentity::parse(raw).unwrap()
    }

    #[test]
    fn owner_may_act_on_own_identities() {
        let alice = principal("alice", &[]);
        assert!(can_act_on(&alice, &id("user-alice-ws")));
        assert!(can_act_on(&alice, &id("user-alice-ws-ssh")));
        assert!(!can_act_on(&alice, &id("user-bob-ws")));
    }

    #[test]
    fn owner_match_is_exact() {
        // "al" is a prefix of "alice" but not the owner segment
        let al = principal("al", &[]);
        assert!(!can_act_on(&al, &id("user-alice-ws")));
    }

    #[test]
    fn administrative_roles_act_on_anything() {
        assert!(can_act_on(&principal("root", &[ADMIN_ROLE]), &id("user-bob-ws")));
        assert!(can_act_on(&principal("ctrl", &[SYSTEM_ROLE]), &id("user-bob-ws")));
    }

    #[test]
    fn agent_role_admits_sessions_but_not_routes() {
        let agent = principal("svc-agent", &[AGENT_ROLE]);
        assert!(authorize_session(&agent, &id("user-bob-ws")).is_ok());
        assert!(matches!(
            authorize(&agent, &id("user-bob-ws")),
            Err(AuthError::Forbidden { .. })
        ));
    }
}
