//! Machine credentials
//!
//! Agents and the controller obtain short-lived bearer tokens through the
//! OAuth2 client-credentials grant. [`TokenSource`] is the seam the agent's
//! refresh loop and the controller's relay client depend on.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::AuthError;

/// Fraction of a token's lifetime after which it should be renewed
pub const REFRESH_FRACTION: f64 = 0.75;

/// A token issued by the identity provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedToken {
    /// Bearer token
    pub access_token: String,
    /// Validity window from issuance; `None` for static tokens
    pub expires_in: Option<Duration>,
    /// Refresh token, for the authorization-code flow
    pub refresh_token: Option<String>,
    /// OIDC ID token, for the authorization-code flow
    pub id_token: Option<String>,
}

impl IssuedToken {
    /// A token that never needs renewal
    pub fn static_token(token: impl Into<String>) -> Self {
        Self {
            access_token: token.into(),
            expires_in: None,
            refresh_token: None,
            id_token: None,
        }
    }

    /// How long to wait before renewing, at 75% of the validity window
    pub fn refresh_after(&self) -> Option<Duration> {
        self.expires_in.map(|d| d.mul_f64(REFRESH_FRACTION))
    }
}

/// Token endpoint response body
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

impl From<TokenResponse> for IssuedToken {
    fn from(r: TokenResponse) -> Self {
        Self {
            access_token: r.access_token,
            expires_in: r.expires_in.map(Duration::from_secs),
            refresh_token: r.refresh_token,
            id_token: r.id_token,
        }
    }
}

/// POST a form to a token endpoint and parse the response
pub(crate) async fn request_token(
    client: &reqwest::Client,
    token_url: &str,
    form: &[(&str, &str)],
) -> Result<IssuedToken, AuthError> {
    let response = client
        .post(token_url)
        .form(form)
        .send()
        .await
        .map_err(|e| AuthError::provider(format!("token request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AuthError::provider(format!(
            "token endpoint returned HTTP {status}: {body}"
        )));
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| AuthError::provider(format!("invalid token response: {e}")))?;
    Ok(token.into())
}

/// Produces bearer tokens on demand
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Obtain a fresh token
    async fn fetch(&self) -> Result<IssuedToken, AuthError>;
}

/// Client-credentials grant parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientCredentials {
    /// OAuth2 client id
    pub client_id: String,
    /// OAuth2 client secret
    pub client_secret: String,
    /// Token endpoint
    pub token_url: String,
}

/// [`TokenSource`] backed by the client-credentials grant
pub struct ClientCredentialsSource {
    client: reqwest::Client,
    credentials: ClientCredentials,
}

impl ClientCredentialsSource {
    /// Create a source using `client` for HTTP
    pub fn new(client: reqwest::Client, credentials: ClientCredentials) -> Self {
        Self {
            client,
            credentials,
        }
    }
}

#[async_trait]
impl TokenSource for ClientCredentialsSource {
    async fn fetch(&self) -> Result<IssuedToken, AuthError> {
        debug!(client_id = %self.credentials.client_id, "Requesting client-credentials token");
        request_token(
            &self.client,
            &self.credentials.token_url,
            &[
                ("grant_type", "client_credentials"),
                ("client_id", &self.credentials.client_id),
                ("client_secret", &self.credentials.client_secret),
            ],
        )
        .await
    }
}

/// [`TokenSource`] that always returns the same token
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    /// Wrap a fixed token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch(&self) -> Result<IssuedToken, AuthError> {
        Ok(IssuedToken::static_token(self.token.clone()))
    }
}
