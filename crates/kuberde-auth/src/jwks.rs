//! JWKS caching
//!
//! Keys are fetched from the issuer's `jwks_uri` and cached for an hour. An
//! unknown `kid` forces an early refresh so key rotation is picked up without
//! waiting for the interval.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, DecodingKey};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::AuthError;

/// How long fetched keys are trusted before refetching
pub const JWKS_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Individual JWK
#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default, rename = "use")]
    use_: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
    #[serde(default)]
    crv: Option<String>,
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

/// A verification key and the algorithm family it serves
#[derive(Clone)]
pub struct VerificationKey {
    /// Decoding key for jsonwebtoken
    pub key: DecodingKey,
    /// Algorithms this key may verify
    pub algorithms: Vec<Algorithm>,
}

struct CachedKeys {
    by_kid: HashMap<String, VerificationKey>,
    fetched_at: Instant,
}

/// Cached key set for one issuer
pub struct JwksCache {
    jwks_uri: String,
    client: reqwest::Client,
    refresh_interval: Duration,
    cache: RwLock<Option<CachedKeys>>,
}

impl JwksCache {
    /// Cache keys served at `jwks_uri`
    pub fn new(client: reqwest::Client, jwks_uri: impl Into<String>) -> Self {
        Self {
            jwks_uri: jwks_uri.into(),
            client,
            refresh_interval: JWKS_REFRESH_INTERVAL,
            cache: RwLock::new(None),
        }
    }

    /// The endpoint keys are fetched from
    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    /// Key for `kid`, or the only key when the token names none
    pub async fn get_key(&self, kid: Option<&str>) -> Result<VerificationKey, AuthError> {
        if let Some(key) = self.lookup_fresh(kid) {
            return Ok(key);
        }

        self.refresh().await?;

        self.lookup(kid).ok_or_else(|| {
            AuthError::invalid(format!("no matching key in JWKS for kid {kid:?}"))
        })
    }

    fn lookup_fresh(&self, kid: Option<&str>) -> Option<VerificationKey> {
        let cache = self.cache.read();
        let cached = cache.as_ref()?;
        if cached.fetched_at.elapsed() > self.refresh_interval {
            return None;
        }
        find(cached, kid)
    }

    fn lookup(&self, kid: Option<&str>) -> Option<VerificationKey> {
        let cache = self.cache.read();
        find(cache.as_ref()?, kid)
    }

    /// Refetch the key set
    ///
    /// A failed fetch keeps the previous keys so a provider blip does not
    /// reject every token.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        debug!(jwks_uri = %self.jwks_uri, "Fetching JWKS");

        let fetched = self.fetch().await;
        let document = match fetched {
            Ok(document) => document,
            Err(e) if self.cache.read().is_some() => {
                warn!(jwks_uri = %self.jwks_uri, error = %e, "JWKS fetch failed, keeping cached keys");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut by_kid = HashMap::new();
        for jwk in document.keys {
            if jwk.use_.as_deref() == Some("enc") {
                continue;
            }
            if let Some(key) = to_verification_key(&jwk)? {
                let kid = jwk.kid.unwrap_or_else(|| "default".to_string());
                by_kid.insert(kid, key);
            }
        }
        if by_kid.is_empty() {
            return Err(AuthError::Config("no usable keys found in JWKS".into()));
        }

        info!(jwks_uri = %self.jwks_uri, key_count = by_kid.len(), "Refreshed JWKS cache");
        *self.cache.write() = Some(CachedKeys {
            by_kid,
            fetched_at: Instant::now(),
        });
        Ok(())
    }

    async fn fetch(&self) -> Result<JwksDocument, AuthError> {
        let response = self
            .client
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| AuthError::provider(format!("failed to fetch JWKS: {e}")))?;
        if !response.status().is_success() {
            return Err(AuthError::provider(format!(
                "JWKS endpoint returned HTTP {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AuthError::provider(format!("invalid JWKS response: {e}")))
    }
}

fn find(cached: &CachedKeys, kid: Option<&str>) -> Option<VerificationKey> {
    match kid {
        Some(kid) => cached.by_kid.get(kid).cloned(),
        None if cached.by_kid.len() == 1 => cached.by_kid.values().next().cloned(),
        None => None,
    }
}

fn to_verification_key(jwk: &Jwk) -> Result<Option<VerificationKey>, AuthError> {
    match jwk.kty.as_str() {
        "RSA" => {
            let (Some(n), Some(e)) = (&jwk.n, &jwk.e) else {
                return Err(AuthError::Config("RSA key missing 'n' or 'e'".into()));
            };
            let key = DecodingKey::from_rsa_components(n, e)
                .map_err(|e| AuthError::Config(format!("invalid RSA key: {e}")))?;
            Ok(Some(VerificationKey {
                key,
                algorithms: vec![
                    Algorithm::RS256,
                    Algorithm::RS384,
                    Algorithm::RS512,
                    Algorithm::PS256,
                    Algorithm::PS384,
                    Algorithm::PS512,
                ],
            }))
        }
        "EC" => {
            let (Some(crv), Some(x), Some(y)) = (&jwk.crv, &jwk.x, &jwk.y) else {
                return Err(AuthError::Config("EC key missing 'crv', 'x' or 'y'".into()));
            };
            let algorithm = match crv.as_str() {
                "P-256" => Algorithm::ES256,
                "P-384" => Algorithm::ES384,
                other => {
                    warn!(crv = %other, "Unsupported EC curve");
                    return Ok(None);
                }
            };
            let key = DecodingKey::from_ec_components(x, y)
                .map_err(|e| AuthError::Config(format!("invalid EC key: {e}")))?;
            Ok(Some(VerificationKey {
                key,
                algorithms: vec![algorithm],
            }))
        }
        kty => {
            warn!(kty = %kty, "Unsupported key type");
            Ok(None)
        }
    }
}
