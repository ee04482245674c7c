//! Authentication errors

use thiserror::Error;

/// Errors raised while authenticating or authorizing an actor
#[derive(Debug, Error)]
pub enum AuthError {
    /// No credential was presented
    #[error("missing credential")]
    Missing,

    /// The credential failed verification
    #[error("invalid credential: {0}")]
    Invalid(String),

    /// The credential verified but its expiry has passed
    #[error("credential expired")]
    Expired,

    /// The browser session backing a cookie was revoked or never existed
    #[error("session revoked")]
    Revoked,

    /// The actor may not act on the identity
    #[error("{subject} may not act on {identity}")]
    Forbidden {
        /// Username of the rejected actor
        subject: String,
        /// Identity the actor tried to act on
        identity: String,
    },

    /// The identity provider failed or returned an unusable response
    #[error("identity provider error: {0}")]
    Provider(String),

    /// Auth is misconfigured
    #[error("auth configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// Create an invalid-credential error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Create a provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden(subject: impl Into<String>, identity: impl Into<String>) -> Self {
        Self::Forbidden {
            subject: subject.into(),
            identity: identity.into(),
        }
    }

    /// Whether the actor failed to prove who they are, as opposed to being
    /// denied access or hitting an upstream failure
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            Self::Missing | Self::Invalid(_) | Self::Expired | Self::Revoked
        )
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match e.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            _ => Self::Invalid(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthenticated_classification() {
        assert!(AuthError::Missing.is_unauthenticated());
        assert!(AuthError::Expired.is_unauthenticated());
        assert!(AuthError::Revoked.is_unauthenticated());
        assert!(!AuthError::forbidden("bob", "user-alice-ws").is_unauthenticated());
        assert!(!AuthError::provider("down").is_unauthenticated());
    }

    #[test]
    fn forbidden_names_both_sides() {
        let err = AuthError::forbidden("bob", "user-alice-ws");
        assert_eq!(err.to_string(), "bob may not act on user-alice-ws");
    }

    #[test]
    fn expired_jwt_maps_to_expired() {
        let err: AuthError =
            jsonwebtoken::errors::Error::from(jsonwebtoken::errors::ErrorKind::ExpiredSignature)
                .into();
        assert!(matches!(err, AuthError::Expired));
    }
}
