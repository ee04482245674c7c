//! Browser login
//!
//! Authorization-code flow against the identity provider. A successful
//! callback records a server-side session and hands the browser the access
//! token in an HttpOnly cookie; the cookie is honoured only while the
//! session record exists.

use axum::extract::{Query, State};
use axum::http::header::{AUTHORIZATION, COOKIE, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use kuberde_auth::extract::cookie_value;
use kuberde_auth::oidc::{generate_state, OidcClient};
use kuberde_auth::{extract_token, AuthError, IssuedToken};
use kuberde_common::SESSION_COOKIE;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{RelayError, Result};
use crate::server::AppState;

/// Cookie holding the login `state` parameter
pub const STATE_COOKIE: &str = "kuberde_oauth_state";

/// Cookie holding where to go after login
pub const RETURN_COOKIE: &str = "kuberde_return_to";

const STATE_MAX_AGE_SECS: u64 = 600;

fn cookie(name: &str, value: &str, path: &str, max_age: Option<u64>, secure: bool) -> String {
    let mut cookie = format!("{name}={value}; Path={path}; HttpOnly; SameSite=Lax");
    if let Some(max_age) = max_age {
        cookie.push_str(&format!("; Max-Age={max_age}"));
    }
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn expired_cookie(name: &str, path: &str, secure: bool) -> String {
    cookie(name, "", path, Some(0), secure)
}

fn header(value: String) -> Result<HeaderValue> {
    HeaderValue::try_from(value).map_err(|e| RelayError::internal(format!("invalid header: {e}")))
}

fn oidc(state: &AppState) -> Result<&OidcClient> {
    state
        .oidc
        .as_deref()
        .ok_or_else(|| AuthError::Config("browser login is not configured".into()).into())
}

/// Only same-site paths; anything else could be an open redirect
fn safe_return_path(path: &str) -> Option<&str> {
    (path.starts_with('/') && !path.starts_with("//") && !path.contains('\\')).then_some(path)
}

/// `GET /auth/login` query
#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    /// Path to land on after login
    pub return_url: Option<String>,
}

pub(crate) async fn login(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
) -> Result<Response> {
    let client = oidc(&state)?;
    let nonce = generate_state();
    let location = client.authorization_url(&nonce)?;
    let secure = state.cookies.secure;

    let mut headers = HeaderMap::new();
    headers.insert(LOCATION, header(location)?);
    headers.append(
        SET_COOKIE,
        header(cookie(STATE_COOKIE, &nonce, "/auth", Some(STATE_MAX_AGE_SECS), secure))?,
    );
    if let Some(path) = query.return_url.as_deref().and_then(safe_return_path) {
        headers.append(
            SET_COOKIE,
            header(cookie(RETURN_COOKIE, path, "/auth", Some(STATE_MAX_AGE_SECS), secure))?,
        );
    }
    Ok((StatusCode::FOUND, headers).into_response())
}

/// `GET /auth/callback` query
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    /// Authorization code
    pub code: Option<String>,
    /// Echoed state
    pub state: Option<String>,
    /// Provider error
    pub error: Option<String>,
}

pub(crate) async fn callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Result<Response> {
    let client = oidc(&state)?;
    if let Some(error) = query.error {
        warn!(%error, "Identity provider returned an error");
        return Err(AuthError::provider(error).into());
    }
    let cookies = headers.get(COOKIE).and_then(|v| v.to_str().ok()).unwrap_or("");
    let expected = cookie_value(cookies, STATE_COOKIE);
    match (expected, query.state.as_deref()) {
        (Some(expected), Some(got)) if expected == got => {}
        _ => return Err(RelayError::bad_request("login state mismatch")),
    }
    let code = query
        .code
        .ok_or_else(|| RelayError::bad_request("missing authorization code"))?;

    let issued = client.exchange_code(&code).await?;
    let principal = state.auth.verify(&issued.access_token).await?;
    state
        .auth
        .sessions()
        .create(&principal, issued.refresh_token.clone());
    info!(username = %principal.username, "Browser login");

    let return_to = cookie_value(cookies, RETURN_COOKIE)
        .and_then(safe_return_path)
        .unwrap_or("/")
        .to_string();
    let secure = state.cookies.secure;
    let mut out = HeaderMap::new();
    out.insert(LOCATION, header(return_to)?);
    out.append(SET_COOKIE, header(session_cookie(&issued, secure))?);
    out.append(SET_COOKIE, header(expired_cookie(STATE_COOKIE, "/auth", secure))?);
    out.append(SET_COOKIE, header(expired_cookie(RETURN_COOKIE, "/auth", secure))?);
    Ok((StatusCode::FOUND, out).into_response())
}

fn session_cookie(issued: &IssuedToken, secure: bool) -> String {
    cookie(
        SESSION_COOKIE,
        &issued.access_token,
        "/",
        issued.expires_in.map(|d| d.as_secs()),
        secure,
    )
}

/// Body of `POST /auth/logout`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggedOut {
    /// Provider logout page, when it supports RP-initiated logout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logout_url: Option<String>,
}

pub(crate) async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let found = extract_token(
        headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
        None,
        headers.get(COOKIE).and_then(|v| v.to_str().ok()),
    );
    if let Some(found) = found {
        if let Ok(principal) = state.auth.verify(&found.token).await {
            if state.auth.sessions().revoke(&principal.session_key) {
                info!(username = %principal.username, "Browser logout");
            }
        }
    }

    let logout_url = state
        .oidc
        .as_deref()
        .and_then(|c| c.logout_url(None, &format!("{}/", state.public_url)));
    let mut out = HeaderMap::new();
    out.insert(
        SET_COOKIE,
        header(expired_cookie(SESSION_COOKIE, "/", state.cookies.secure))?,
    );
    Ok((StatusCode::OK, out, Json(LoggedOut { logout_url })).into_response())
}

/// Body of `POST /auth/refresh`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Refreshed {
    /// Seconds until the new token expires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

/// Swap the session's refresh token for a new cookie
///
/// The current cookie must still be valid; browsers refresh ahead of
/// expiry.
pub(crate) async fn refresh(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let client = oidc(&state)?;
    let token = headers
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|c| cookie_value(c, SESSION_COOKIE))
        .ok_or(AuthError::Missing)?;
    let current = state.auth.verify(token).await?;
    let sessions = state.auth.sessions();
    let refresh_token = sessions
        .get(&current.session_key)
        .ok_or(AuthError::Revoked)?
        .refresh_token
        .ok_or_else(|| RelayError::bad_request("session has no refresh token"))?;

    let issued = client.refresh(&refresh_token).await?;
    let principal = state.auth.verify(&issued.access_token).await?;
    sessions.revoke(&current.session_key);
    sessions.create(
        &principal,
        issued.refresh_token.clone().or(Some(refresh_token)),
    );

    let mut out = HeaderMap::new();
    out.insert(
        SET_COOKIE,
        header(session_cookie(&issued, state.cookies.secure))?,
    );
    let body = Refreshed {
        expires_in: issued.expires_in.map(|d| d.as_secs()),
    };
    Ok((StatusCode::OK, out, Json(body)).into_response())
}
