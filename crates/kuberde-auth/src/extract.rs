//! Credential extraction
//!
//! Tokens are looked for in the `Authorization: Bearer` header, then the
//! `token` query parameter, then the session cookie. The functions take raw
//! header strings so both axum handlers and the relay's raw HTTP ingress can
//! use them.

use kuberde_common::SESSION_COOKIE;

/// Where a token was found
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenOrigin {
    /// `Authorization: Bearer`
    Bearer,
    /// `?token=`
    Query,
    /// `kuberde_session` cookie
    Cookie,
}

/// A token and where it came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractedToken {
    /// Raw token
    pub token: String,
    /// Source
    pub origin: TokenOrigin,
}

/// Find a token in the request parts, in precedence order
pub fn extract_token(
    authorization: Option<&str>,
    query: Option<&str>,
    cookie: Option<&str>,
) -> Option<ExtractedToken> {
    if let Some(token) = authorization.and_then(bearer_token) {
        return Some(ExtractedToken {
            token: token.to_string(),
            origin: TokenOrigin::Bearer,
        });
    }
    if let Some(token) = query.and_then(|q| query_param(q, "token")) {
        return Some(ExtractedToken {
            token,
            origin: TokenOrigin::Query,
        });
    }
    cookie
        .and_then(|c| cookie_value(c, SESSION_COOKIE))
        .map(|token| ExtractedToken {
            token: token.to_string(),
            origin: TokenOrigin::Cookie,
        })
}

/// Token from an `Authorization` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Decoded value of a query parameter
pub fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

/// Value of cookie `name` in a `Cookie` header
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"'))
        .filter(|v| !v.is_empty())
}
