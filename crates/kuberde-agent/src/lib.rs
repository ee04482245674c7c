//! KubeRDE agent
//!
//! Runs inside the workload pod. Holds one tunnel session to the relay and
//! bridges each relay-opened stream to the local service its preamble names.

pub mod client;
pub mod config;
pub mod error;
pub mod services;
pub mod streams;
pub mod token;

pub use client::{AgentClient, ClientSettings, ClientState};
pub use config::{AgentConfig, CredentialConfig, EnvSource, OsEnv};
pub use error::{AgentError, Result};
pub use services::{LocalService, ServiceTable};
pub use token::Credentials;

use std::sync::Arc;

use kuberde_auth::{ClientCredentialsSource, StaticTokenSource, TokenSource};

/// Token source for the configured credential flow
pub fn token_source(config: &CredentialConfig, http: reqwest::Client) -> Option<Arc<dyn TokenSource>> {
    match config {
        CredentialConfig::ClientCredentials(credentials) => Some(Arc::new(
            ClientCredentialsSource::new(http, credentials.clone()),
        )),
        CredentialConfig::Static(token) => Some(Arc::new(StaticTokenSource::new(token.clone()))),
        CredentialConfig::Anonymous => None,
    }
}
