//! Shared test fixtures

use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use kuberde_auth::{Authenticator, JwtVerifier, Principal, SessionStore, VerifierConfig};
use serde_json::json;

pub const SECRET: &[u8] = b"relay-test-secret";

pub fn principal(username: &str, roles: &[&str]) -> Principal {
    Principal {
        subject: format!("sub-{username}"),
        username: username.to_string(),
        roles: roles.iter().map(|r| r.to_string()).collect(),
        expires_at: Utc::now() + chrono::Duration::hours(1),
        session_key: format!("sid-{username}"),
    }
}

/// HS256 token for `username` valid for `ttl_secs`
pub fn token(username: &str, roles: &[&str], ttl_secs: i64) -> String {
    let now = Utc::now().timestamp();
    let claims = json!({
        "sub": format!("sub-{username}"),
        "preferred_username": username,
        "realm_access": { "roles": roles },
        "iat": now,
        "exp": now + ttl_secs,
        "sid": format!("sid-{username}-{now}"),
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

pub fn authenticator() -> Authenticator {
    Authenticator::new(
        Arc::new(JwtVerifier::hmac(SECRET, VerifierConfig::default())),
        Arc::new(SessionStore::new()),
    )
}
