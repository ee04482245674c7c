//! Browser login via the OIDC authorization-code flow

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::credentials::{request_token, IssuedToken};
use crate::AuthError;

/// Scopes requested at login
pub const DEFAULT_SCOPES: &[&str] = &["openid", "profile", "email"];

/// Subset of the provider's discovery document
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ProviderMetadata {
    /// Issuer identifier
    pub issuer: String,
    /// Browser redirect target for login
    pub authorization_endpoint: String,
    /// Code and refresh exchange endpoint
    pub token_endpoint: String,
    /// Published signing keys
    pub jwks_uri: String,
    /// RP-initiated logout endpoint
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

/// Fetch `{issuer}/.well-known/openid-configuration`
pub async fn discover(
    client: &reqwest::Client,
    issuer_url: &str,
) -> Result<ProviderMetadata, AuthError> {
    let discovery_url = format!(
        "{}/.well-known/openid-configuration",
        issuer_url.trim_end_matches('/')
    );
    debug!(url = %discovery_url, "Fetching OIDC discovery document");

    let metadata: ProviderMetadata = client
        .get(&discovery_url)
        .send()
        .await
        .map_err(|e| AuthError::provider(format!("failed to fetch OIDC discovery: {e}")))?
        .error_for_status()
        .map_err(|e| AuthError::provider(format!("OIDC discovery failed: {e}")))?
        .json()
        .await
        .map_err(|e| AuthError::provider(format!("invalid OIDC discovery response: {e}")))?;

    info!(issuer = %metadata.issuer, "Discovered OIDC provider");
    Ok(metadata)
}

/// Registered client for the authorization-code flow
#[derive(Clone, Debug)]
pub struct OidcClientConfig {
    /// OAuth2 client id
    pub client_id: String,
    /// OAuth2 client secret, absent for public clients
    pub client_secret: Option<String>,
    /// `{public_url}/auth/callback`
    pub redirect_uri: String,
}

/// Authorization-code client
pub struct OidcClient {
    http: reqwest::Client,
    metadata: ProviderMetadata,
    config: OidcClientConfig,
}

impl OidcClient {
    /// Create a client for a discovered provider
    pub fn new(http: reqwest::Client, metadata: ProviderMetadata, config: OidcClientConfig) -> Self {
        Self {
            http,
            metadata,
            config,
        }
    }

    /// Provider metadata
    pub fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    /// Where to send the browser to log in
    pub fn authorization_url(&self, state: &str) -> Result<String, AuthError> {
        let mut url = Url::parse(&self.metadata.authorization_endpoint)
            .map_err(|e| AuthError::Config(format!("invalid authorization endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &DEFAULT_SCOPES.join(" "))
            .append_pair("state", state);
        Ok(url.into())
    }

    /// Exchange an authorization code
    pub async fn exchange_code(&self, code: &str) -> Result<IssuedToken, AuthError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        request_token(&self.http, &self.metadata.token_endpoint, &form).await
    }

    /// Exchange a refresh token
    pub async fn refresh(&self, refresh_token: &str) -> Result<IssuedToken, AuthError> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        request_token(&self.http, &self.metadata.token_endpoint, &form).await
    }

    /// Provider logout URL, when the provider supports RP-initiated logout
    pub fn logout_url(&self, id_token_hint: Option<&str>, post_logout_redirect: &str) -> Option<String> {
        let endpoint = self.metadata.end_session_endpoint.as_deref()?;
        let mut url = Url::parse(endpoint).ok()?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("client_id", &self.config.client_id)
                .append_pair("post_logout_redirect_uri", post_logout_redirect);
            if let Some(hint) = id_token_hint {
                pairs.append_pair("id_token_hint", hint);
            }
        }
        Some(url.into())
    }
}

/// Random value for the `state` parameter and cookie
pub fn generate_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}
