//! Operator errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kuberde_auth::AuthError;
use thiserror::Error;

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors raised while reconciling or serving the webhook
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Spec validation or shared-model error
    #[error(transparent)]
    Common(#[from] kuberde_common::Error),

    /// The relay's management API answered with an error
    #[error("relay returned HTTP {status} for {operation}: {message}")]
    Relay {
        /// What was attempted
        operation: String,
        /// HTTP status
        status: u16,
        /// Response body
        message: String,
    },

    /// The relay could not be reached
    #[error("relay unreachable during {operation}: {message}")]
    RelayTransport {
        /// What was attempted
        operation: String,
        /// Transport error
        message: String,
    },

    /// Token acquisition or verification failed
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The webhook named an identity no workload owns
    #[error("no workload for identity {0}")]
    UnknownIdentity(String),

    /// Malformed webhook request
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl OperatorError {
    /// Create a relay error
    pub fn relay(operation: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Relay {
            operation: operation.into(),
            status,
            message: message.into(),
        }
    }

    /// Create a relay transport error
    pub fn relay_transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RelayTransport {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the API server rejected a write on a stale resource version
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(e) } if e.code == 409)
    }

    /// Whether the API server reported the object missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(e) } if e.code == 404)
    }

    /// Whether retrying may succeed without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Common(e) => e.is_retryable(),
            Self::BadRequest(_) | Self::UnknownIdentity(_) => false,
            _ => true,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(AuthError::Forbidden { .. }) => StatusCode::FORBIDDEN,
            Self::Auth(e) if e.is_unauthenticated() => StatusCode::UNAUTHORIZED,
            Self::UnknownIdentity(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for OperatorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": status.canonical_reason().unwrap_or("Error"),
            "message": self.to_string(),
            "code": status.as_u16(),
        });
        (status, axum::Json(body)).into_response()
    }
}
