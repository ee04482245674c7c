//! Agent bootstrap configuration
//!
//! The controller hands the agent everything through environment
//! variables. Reading them goes through [`EnvSource`] so the parsing can be
//! tested without touching the process environment.

use kuberde_auth::ClientCredentials;
use kuberde_common::{AgentIdentity, SERVICES_ENV};

use crate::error::{AgentError, Result};
use crate::services::ServiceTable;

/// Relay tunnel endpoint used when `SERVER_URL` is unset
pub const DEFAULT_SERVER_URL: &str = "ws://kuberde-relay:8080/ws";

/// Read access to environment variables
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Value of `key`, if set and non-empty
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads the process environment
#[derive(Clone, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

/// How the agent obtains its bearer token
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialConfig {
    /// Client-credentials grant, renewed before expiry
    ClientCredentials(ClientCredentials),
    /// Fixed `AUTH_TOKEN`
    Static(String),
    /// No token; only useful against a development relay
    Anonymous,
}

/// Everything the agent needs to run
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Relay tunnel endpoint
    pub server_url: String,
    /// Identity the session registers under
    pub agent_id: AgentIdentity,
    /// Local services
    pub services: ServiceTable,
    /// Credential source
    pub credentials: CredentialConfig,
}

impl AgentConfig {
    /// Build the configuration from the environment
    pub fn from_env(env: &dyn EnvSource) -> Result<Self> {
        let agent_id = env
            .var("AGENT_ID")
            .ok_or_else(|| AgentError::config("AGENT_ID is required"))?;
        let agent_id = AgentIdentity::parse(&agent_id)
            .map_err(|e| AgentError::config(format!("invalid AGENT_ID: {e}")))?;

        let services = match (env.var(SERVICES_ENV), env.var("LOCAL_TARGET")) {
            (Some(raw), _) => ServiceTable::from_json(&raw)?,
            (None, Some(target)) => ServiceTable::from_local_target(&target)?,
            (None, None) => {
                return Err(AgentError::config(format!(
                    "either {SERVICES_ENV} or LOCAL_TARGET is required"
                )))
            }
        };

        let credentials = match (
            env.var("AUTH_CLIENT_ID"),
            env.var("AUTH_CLIENT_SECRET"),
            env.var("AUTH_TOKEN_URL"),
        ) {
            (Some(client_id), Some(client_secret), Some(token_url)) => {
                CredentialConfig::ClientCredentials(ClientCredentials {
                    client_id,
                    client_secret,
                    token_url,
                })
            }
            (None, None, None) => match env.var("AUTH_TOKEN") {
                Some(token) => CredentialConfig::Static(token),
                None => CredentialConfig::Anonymous,
            },
            _ => {
                return Err(AgentError::config(
                    "AUTH_CLIENT_ID, AUTH_CLIENT_SECRET and AUTH_TOKEN_URL must be set together",
                ))
            }
        };

        Ok(Self {
            server_url: env
                .var("SERVER_URL")
                .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string()),
            agent_id,
            services,
            credentials,
        })
    }

    /// Tunnel URL with the identity query
    pub fn tunnel_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.server_url)
            .map_err(|e| AgentError::config(format!("invalid SERVER_URL: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(AgentError::config(format!(
                "SERVER_URL must be ws:// or wss://, got {}",
                url.scheme()
            )));
        }
        url.query_pairs_mut().append_pair("id", self.agent_id.as_str());
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> MockEnvSource {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut mock = MockEnvSource::new();
        mock.expect_var().returning(move |key| vars.get(key).cloned());
        mock
    }

    const SERVICES: &str = r#"{"services":[{"name":"ssh","port":22,"protocol":"TCP"}]}"#;

    #[test]
    fn full_environment() {
        let config = AgentConfig::from_env(&env(&[
            ("AGENT_ID", "user-alice-dev"),
            ("SERVER_URL", "wss://relay.example.com/ws"),
            (SERVICES_ENV, SERVICES),
            ("AUTH_CLIENT_ID", "agent"),
            ("AUTH_CLIENT_SECRET", "s3cret"),
            ("AUTH_TOKEN_URL", "https://idp.example.com/token"),
        ]))
        .unwrap();

        assert_eq!(config.agent_id.as_str(), "user-alice-dev");
        assert!(matches!(
            config.credentials,
            CredentialConfig::ClientCredentials(ref c) if c.client_id == "agent"
        ));
        assert_eq!(
            config.tunnel_url().unwrap().as_str(),
            "wss://relay.example.com/ws?id=user-alice-dev"
        );
    }

    #[test]
    fn defaults_and_fallbacks() {
        let config = AgentConfig::from_env(&env(&[
            ("AGENT_ID", "user-alice-dev"),
            ("LOCAL_TARGET", "127.0.0.1:8888"),
            ("AUTH_TOKEN", "static"),
        ]))
        .unwrap();

        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
        assert!(config.services.get("default").is_some());
        assert_eq!(config.credentials, CredentialConfig::Static("static".into()));

        let anonymous = AgentConfig::from_env(&env(&[
            ("AGENT_ID", "user-alice-dev"),
            (SERVICES_ENV, SERVICES),
        ]))
        .unwrap();
        assert_eq!(anonymous.credentials, CredentialConfig::Anonymous);
    }

    #[test]
    fn rejects_incomplete_environment() {
        assert!(AgentConfig::from_env(&env(&[(SERVICES_ENV, SERVICES)])).is_err());
        assert!(AgentConfig::from_env(&env(&[("AGENT_ID", "user-alice-dev")])).is_err());
        assert!(AgentConfig::from_env(&env(&[
            ("AGENT_ID", "user-alice-dev"),
            (SERVICES_ENV, SERVICES),
            ("AUTH_CLIENT_ID", "agent"),
        ]))
        .is_err());
    }

    #[test]
    fn tunnel_url_requires_websocket_scheme() {
        let mut config = AgentConfig::from_env(&env(&[
            ("AGENT_ID", "user-alice-dev"),
            (SERVICES_ENV, SERVICES),
        ]))
        .unwrap();
        config.server_url = "https://relay.example.com/ws".into();
        assert!(config.tunnel_url().is_err());
    }
}
