//! Token verification
//!
//! Every actor's credential is a JWT. [`JwtVerifier`] checks it against
//! either the issuer's JWKS or a static HMAC secret and maps the claims to a
//! [`Principal`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::jwks::JwksCache;
use crate::{AuthError, Principal};

/// Clock skew tolerated on `exp` and `nbf`
const DEFAULT_LEEWAY_SECS: u64 = 30;

/// Verifies a raw bearer token
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify `token` and return the actor it belongs to
    async fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

#[derive(Debug, Default, Deserialize)]
struct RealmAccess {
    #[serde(default)]
    roles: Vec<String>,
}

/// Claims we read; `exp`, `iss` and `aud` are checked by jsonwebtoken
#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    exp: i64,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    realm_access: Option<RealmAccess>,
    #[serde(default)]
    roles: Option<Vec<String>>,
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    jti: Option<String>,
}

/// Where signing keys come from
pub enum KeySource {
    /// Shared secret, HS256
    Hmac(DecodingKey),
    /// The issuer's published key set
    Jwks(Arc<JwksCache>),
}

/// Verification settings
#[derive(Clone, Debug, Default)]
pub struct VerifierConfig {
    /// Expected `iss`; unchecked when `None`
    pub issuer: Option<String>,
    /// Accepted `aud` values; unchecked when empty
    pub audiences: Vec<String>,
}

/// JWT verifier backed by jsonwebtoken
pub struct JwtVerifier {
    keys: KeySource,
    config: VerifierConfig,
}

impl JwtVerifier {
    /// Verifier for tokens signed by the issuer's JWKS
    pub fn jwks(cache: Arc<JwksCache>, config: VerifierConfig) -> Self {
        Self {
            keys: KeySource::Jwks(cache),
            config,
        }
    }

    /// Verifier for HS256 tokens signed with `secret`
    pub fn hmac(secret: &[u8], config: VerifierConfig) -> Self {
        Self {
            keys: KeySource::Hmac(DecodingKey::from_secret(secret)),
            config,
        }
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.leeway = DEFAULT_LEEWAY_SECS;
        validation.validate_exp = true;
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer]);
        }
        if self.config.audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.config.audiences);
        }
        validation
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let header = decode_header(token)?;

        let claims = match &self.keys {
            KeySource::Hmac(key) => {
                if header.alg != Algorithm::HS256 {
                    return Err(AuthError::invalid(format!(
                        "unexpected algorithm {:?}",
                        header.alg
                    )));
                }
                decode::<Claims>(token, key, &self.validation(Algorithm::HS256))?.claims
            }
            KeySource::Jwks(cache) => {
                let key = cache.get_key(header.kid.as_deref()).await?;
                if !key.algorithms.contains(&header.alg) {
                    return Err(AuthError::invalid(format!(
                        "algorithm {:?} does not match key",
                        header.alg
                    )));
                }
                decode::<Claims>(token, &key.key, &self.validation(header.alg))?.claims
            }
        };

        let principal = principal_from_claims(claims, token)?;
        debug!(
            username = %principal.username,
            roles = ?principal.roles,
            "Verified token"
        );
        Ok(principal)
    }
}

fn principal_from_claims(claims: Claims, token: &str) -> Result<Principal, AuthError> {
    let subject = claims
        .sub
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AuthError::invalid("missing sub claim"))?;
    let username = claims
        .preferred_username
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| subject.clone());
    let roles = match claims.realm_access {
        Some(realm) if !realm.roles.is_empty() => realm.roles,
        _ => claims.roles.unwrap_or_default(),
    };
    let expires_at = DateTime::<Utc>::from_timestamp(claims.exp, 0)
        .ok_or_else(|| AuthError::invalid("exp out of range"))?;
    let session_key = claims
        .sid
        .or(claims.jti)
        .unwrap_or_else(|| token_hash(token));

    Ok(Principal {
        subject,
        username,
        roles,
        expires_at,
        session_key,
    })
}

/// Hex SHA-256 of a raw token, used as a session key when the token has no
/// `sid` or `jti`
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::testing::{mint, user_token, SECRET};
    use super::*;

    fn verifier() -> JwtVerifier {
        JwtVerifier::hmac(SECRET, VerifierConfig::default())
    }

    #[tokio::test]
    async fn realm_roles_and_username_are_read() {
        let token = user_token("alice", &["admin"], 300);
        let principal = verifier().verify(&token).await.unwrap();
        assert_eq!(principal.username, "alice");
        assert_eq!(principal.subject, "sub-alice");
        assert_eq!(principal.roles, vec!["admin"]);
        assert_eq!(principal.session_key, "sid-alice");
    }

    #[tokio::test]
    async fn falls_back_to_sub_and_flat_roles() {
        let exp = Utc::now().timestamp() + 300;
        let token = mint(json!({
            "sub": "svc-agent",
            "roles": ["kuberde-agent"],
            "exp": exp,
            "jti": "j-1",
        }));
        let principal = verifier().verify(&token).await.unwrap();
        assert_eq!(principal.username, "svc-agent");
        assert_eq!(principal.roles, vec!["kuberde-agent"]);
        assert_eq!(principal.session_key, "j-1");
    }

    #[tokio::test]
    async fn session_key_defaults_to_token_hash() {
        let exp = Utc::now().timestamp() + 300;
        let token = mint(json!({ "sub": "bob", "exp": exp }));
        let principal = verifier().verify(&token).await.unwrap();
        assert_eq!(principal.session_key, token_hash(&token));
        assert_eq!(principal.session_key.len(), 64);
    }

    #[tokio::test]
    async fn expired_tokens_are_rejected_as_expired() {
        let token = user_token("alice", &[], -3600);
        assert!(matches!(
            verifier().verify(&token).await,
            Err(AuthError::Expired)
        ));
    }

    #[tokio::test]
    async fn wrong_secret_is_invalid() {
        let token = user_token("alice", &[], 300);
        let other = JwtVerifier::hmac(b"another-secret", VerifierConfig::default());
        assert!(matches!(
            other.verify(&token).await,
            Err(AuthError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn issuer_is_enforced_when_configured() {
        let exp = Utc::now().timestamp() + 300;
        let token = mint(json!({ "sub": "alice", "exp": exp, "iss": "https://elsewhere" }));
        let strict = JwtVerifier::hmac(
            SECRET,
            VerifierConfig {
                issuer: Some("https://sso.example.com/realms/kuberde".into()),
                audiences: vec![],
            },
        );
        assert!(strict.verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn garbage_and_empty_tokens() {
        assert!(matches!(verifier().verify("").await, Err(AuthError::Missing)));
        assert!(matches!(
            verifier().verify("not-a-jwt").await,
            Err(AuthError::Invalid(_))
        ));
    }
}
