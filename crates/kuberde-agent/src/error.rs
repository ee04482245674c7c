//! Agent errors

use kuberde_auth::AuthError;
use kuberde_mux::MuxError;

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors raised by the agent
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Bootstrap environment is missing or malformed
    #[error("configuration error: {0}")]
    Config(String),

    /// Could not reach the relay
    #[error("connection failed: {0}")]
    Connect(String),

    /// The relay refused the tunnel upgrade
    #[error("relay rejected the tunnel with HTTP {0}")]
    Rejected(u16),

    /// Credential could not be obtained
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Stream multiplexing failed
    #[error(transparent)]
    Mux(#[from] MuxError),

    /// The preamble named a service the agent does not expose
    #[error("unknown service {0}")]
    UnknownService(String),

    /// The local service never accepted a connection
    #[error("service {service} unreachable at {addr}: {reason}")]
    Unreachable {
        /// Service name
        service: String,
        /// `host:port` that was dialed
        addr: String,
        /// Last dial error
        reason: String,
    },
}

impl AgentError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the relay refused our credential
    pub fn is_credential_rejected(&self) -> bool {
        matches!(self, Self::Rejected(401))
    }
}
