//! Relay errors and their HTTP mapping

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kuberde_auth::AuthError;
use kuberde_mux::MuxError;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors raised by the relay
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// No route for the port or host
    #[error("no route for {0}")]
    NoRoute(String),

    /// The route exists but its agent has no live session
    #[error("agent {0} unavailable")]
    AgentUnavailable(String),

    /// Authentication or authorization failed
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The key is bound to an identity the caller may not supersede
    #[error("{key} is already bound to {existing}")]
    Conflict {
        /// Route key
        key: String,
        /// Identity currently holding it
        existing: String,
    },

    /// The route key is malformed or reserved
    #[error("invalid route key: {0}")]
    InvalidKey(String),

    /// The port could not be bound
    #[error("port {port} unavailable: {reason}")]
    PortUnavailable {
        /// Requested port
        port: u16,
        /// Bind error
        reason: String,
    },

    /// The requested resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The request was malformed
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A bounded wait expired
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Stream multiplexing failed
    #[error(transparent)]
    Mux(#[from] MuxError),

    /// I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Create a bad-request error
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoRoute(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AgentUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Auth(AuthError::Forbidden { .. }) => StatusCode::FORBIDDEN,
            Self::Auth(AuthError::Provider(_)) => StatusCode::BAD_GATEWAY,
            Self::Auth(AuthError::Config(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict { .. } | Self::PortUnavailable { .. } => StatusCode::CONFLICT,
            Self::InvalidKey(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Mux(_) => StatusCode::BAD_GATEWAY,
            Self::Io(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoRoute(_) => "NoRoute",
            Self::AgentUnavailable(_) => "AgentUnavailable",
            Self::Auth(AuthError::Expired) => "Expired",
            Self::Auth(AuthError::Forbidden { .. }) => "Forbidden",
            Self::Auth(_) => "Unauthorized",
            Self::Conflict { .. } => "Conflict",
            Self::InvalidKey(_) => "InvalidKey",
            Self::PortUnavailable { .. } => "PortUnavailable",
            Self::NotFound(_) => "NotFound",
            Self::BadRequest(_) => "BadRequest",
            Self::Timeout(_) => "Timeout",
            Self::Mux(_) | Self::Io(_) | Self::Internal(_) => "Internal",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.reason(),
            "message": self.to_string(),
            "code": status.as_u16(),
        });
        (status, axum::Json(body)).into_response()
    }
}
