//! Authentication for KubeRDE
//!
//! Every actor presents a bearer JWT: users via the CLI or a browser cookie,
//! agents and the controller via client credentials. This crate verifies
//! those tokens, tracks browser sessions, checks ownership of agent
//! identities and obtains machine tokens.

#![deny(missing_docs)]

pub mod authz;
pub mod credentials;
pub mod error;
pub mod extract;
pub mod jwks;
pub mod oidc;
pub mod principal;
pub mod sessions;
pub mod verifier;

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

pub use authz::{authorize, authorize_session, can_act_on, ADMIN_ROLE, AGENT_ROLE, SYSTEM_ROLE};
pub use credentials::{
    ClientCredentials, ClientCredentialsSource, IssuedToken, StaticTokenSource, TokenSource,
};
pub use error::AuthError;
pub use extract::{extract_token, ExtractedToken, TokenOrigin};
pub use principal::{ActorKind, Principal};
pub use sessions::SessionStore;
pub use verifier::{JwtVerifier, TokenVerifier, VerifierConfig};

/// Verifies extracted tokens and enforces session records for cookies
#[derive(Clone)]
pub struct Authenticator {
    verifier: Arc<dyn TokenVerifier>,
    sessions: Arc<SessionStore>,
}

impl Authenticator {
    /// Combine a verifier with the session store
    pub fn new(verifier: Arc<dyn TokenVerifier>, sessions: Arc<SessionStore>) -> Self {
        Self { verifier, sessions }
    }

    /// The browser session store
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Verify a bare token
    pub async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        self.verifier.verify(token).await
    }

    /// Verify a token found in a request
    ///
    /// Cookie tokens additionally need a live session record.
    pub async fn authenticate(&self, found: Option<ExtractedToken>) -> Result<Principal, AuthError> {
        let found = found.ok_or(AuthError::Missing)?;
        let principal = self.verifier.verify(&found.token).await?;
        if found.origin == TokenOrigin::Cookie
            && !self.sessions.is_active(&principal.session_key, Utc::now())
        {
            debug!(username = %principal.username, "Cookie without a live session");
            return Err(AuthError::Revoked);
        }
        Ok(principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::testing::{user_token, SECRET};

    fn authenticator() -> Authenticator {
        Authenticator::new(
            Arc::new(JwtVerifier::hmac(SECRET, VerifierConfig::default())),
            Arc::new(SessionStore::new()),
        )
    }

    fn cookie(token: &str) -> Option<ExtractedToken> {
        Some(ExtractedToken {
            token: token.to_string(),
            origin: TokenOrigin::Cookie,
        })
    }

    #[tokio::test]
    async fn bearer_tokens_need_no_session_record() {
        let auth = authenticator();
        let token = user_token("alice", &[], 300);
        let found = extract_token(Some(&format!("Bearer {token}")), None, None);
        assert_eq!(auth.authenticate(found).await.unwrap().username, "alice");
    }

    /// Story: a browser user logs in, uses the cookie, logs out, and the
    /// same cookie stops working even though the token has not expired.
    #[tokio::test]
    async fn story_logout_revokes_cookie() {
        let auth = authenticator();
        let token = user_token("alice", &[], 300);

        // Before login there is no session record
        assert!(matches!(
            auth.authenticate(cookie(&token)).await,
            Err(AuthError::Revoked)
        ));

        // Login records the session
        let principal = auth.verify(&token).await.unwrap();
        auth.sessions().create(&principal, None);
        assert!(auth.authenticate(cookie(&token)).await.is_ok());

        // Logout revokes it
        assert!(auth.sessions().revoke(&principal.session_key));
        assert!(matches!(
            auth.authenticate(cookie(&token)).await,
            Err(AuthError::Revoked)
        ));
    }

    #[tokio::test]
    async fn missing_credential() {
        assert!(matches!(
            authenticator().authenticate(None).await,
            Err(AuthError::Missing)
        ));
    }

    #[tokio::test]
    async fn mocked_verifier_drives_authentication() {
        let mut verifier = verifier::MockTokenVerifier::new();
        verifier
            .expect_verify()
            .returning(|_| Ok(principal::fixtures::principal("bob", &[SYSTEM_ROLE])));
        let auth = Authenticator::new(Arc::new(verifier), Arc::new(SessionStore::new()));

        let found = extract_token(None, Some("token=opaque"), None);
        let principal = auth.authenticate(found).await.unwrap();
        assert_eq!(principal.kind(), ActorKind::System);
    }
}
