//! Relay management API client
//!
//! The controller is the only writer of routes. Every call carries the
//! operator's system-identity token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kuberde_auth::TokenSource;
use kuberde_common::AgentIdentity;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::{OperatorError, Result};

/// Per-request timeout
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether a route carries traffic
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteState {
    /// Traffic flows
    Active,
    /// Workload idle; lookups fire a scale-up
    Parked,
}

/// Route as listed by the relay
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedRoute {
    /// `TCP` or `HTTP`
    pub kind: String,
    /// Port of a TCP route
    #[serde(default)]
    pub port: Option<u16>,
    /// Prefix of an HTTP route
    #[serde(default)]
    pub hostname_prefix: Option<String>,
    /// Per-service identity
    #[serde(rename = "agentID")]
    pub agent_id: AgentIdentity,
    /// Service name
    pub service: String,
    /// Current state
    pub state: RouteState,
}

/// Activity the relay reports for an agent
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    /// A live tunnel session exists
    pub online: bool,
    /// Last traffic or connect
    pub last_activity: DateTime<Utc>,
    /// Connections are bridged right now
    pub has_active_session: bool,
    /// Bridged connections
    pub active_connections: usize,
}

/// The relay operations the controller needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RelayApi: Send + Sync {
    /// Route `port` to `service` on `identity`
    async fn register_tcp(&self, identity: &AgentIdentity, service: &str, port: u16) -> Result<()>;

    /// Remove or park the route on `port`; missing routes are not an error
    async fn deregister_tcp(&self, port: u16, park: bool) -> Result<()>;

    /// Route hostnames under `prefix` to `service` on `identity`
    async fn register_http(&self, identity: &AgentIdentity, service: &str, prefix: &str) -> Result<()>;

    /// Remove or park the route for `prefix`; missing routes are not an error
    async fn deregister_http(&self, prefix: &str, park: bool) -> Result<()>;

    /// Routes whose target belongs to `identity`'s workload
    async fn list_routes(&self, identity: &AgentIdentity) -> Result<Vec<ObservedRoute>>;

    /// Activity for `identity`; `None` when the relay has never seen it
    async fn agent_stats(&self, identity: &AgentIdentity) -> Result<Option<AgentStats>>;
}

#[derive(Serialize)]
struct RegisterTcp<'a> {
    #[serde(rename = "agentID")]
    agent_id: &'a AgentIdentity,
    service: &'a str,
    port: u16,
}

#[derive(Serialize)]
struct DeregisterTcp {
    port: u16,
    park: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterHttp<'a> {
    #[serde(rename = "agentID")]
    agent_id: &'a AgentIdentity,
    service: &'a str,
    hostname_prefix: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeregisterHttp<'a> {
    hostname_prefix: &'a str,
    park: bool,
}

/// [`RelayApi`] over HTTP
pub struct HttpRelayClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl HttpRelayClient {
    /// Client for the relay at `base_url`
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    async fn send(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let token = self.tokens.fetch().await?;
        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&token.access_token)
            .timeout(RELAY_TIMEOUT);
        if let Some(body) = body {
            request = request.json(&body);
        }
        debug!(operation, path, "Calling relay");
        request
            .send()
            .await
            .map_err(|e| OperatorError::relay_transport(operation, e.to_string()))
    }

    async fn expect_success(operation: &str, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(OperatorError::relay(operation, status.as_u16(), message))
    }

    async fn deregister(&self, operation: &str, path: &str, body: serde_json::Value) -> Result<()> {
        let response = self.send(operation, Method::DELETE, path, Some(body)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::expect_success(operation, response).await.map(|_| ())
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| OperatorError::internal(e.to_string()))
}

#[async_trait]
impl RelayApi for HttpRelayClient {
    async fn register_tcp(&self, identity: &AgentIdentity, service: &str, port: u16) -> Result<()> {
        let body = to_json(&RegisterTcp {
            agent_id: identity,
            service,
            port,
        })?;
        let response = self
            .send("register_tcp", Method::POST, "/mgmt/services/tcp", Some(body))
            .await?;
        Self::expect_success("register_tcp", response).await.map(|_| ())
    }

    async fn deregister_tcp(&self, port: u16, park: bool) -> Result<()> {
        let body = to_json(&DeregisterTcp { port, park })?;
        self.deregister("deregister_tcp", "/mgmt/services/tcp", body).await
    }

    async fn register_http(&self, identity: &AgentIdentity, service: &str, prefix: &str) -> Result<()> {
        let body = to_json(&RegisterHttp {
            agent_id: identity,
            service,
            hostname_prefix: prefix,
        })?;
        let response = self
            .send("register_http", Method::POST, "/mgmt/services/http", Some(body))
            .await?;
        Self::expect_success("register_http", response).await.map(|_| ())
    }

    async fn deregister_http(&self, prefix: &str, park: bool) -> Result<()> {
        let body = to_json(&DeregisterHttp {
            hostname_prefix: prefix,
            park,
        })?;
        self.deregister("deregister_http", "/mgmt/services/http", body).await
    }

    async fn list_routes(&self, identity: &AgentIdentity) -> Result<Vec<ObservedRoute>> {
        let path = format!("/mgmt/routes?agentID={identity}");
        let response = self.send("list_routes", Method::GET, &path, None).await?;
        Self::expect_success("list_routes", response)
            .await?
            .json()
            .await
            .map_err(|e| OperatorError::relay_transport("list_routes", e.to_string()))
    }

    async fn agent_stats(&self, identity: &AgentIdentity) -> Result<Option<AgentStats>> {
        let path = format!("/mgmt/agents/{identity}");
        let response = self.send("agent_stats", Method::GET, &path, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::expect_success("agent_stats", response)
            .await?
            .json()
            .await
            .map(Some)
            .map_err(|e| OperatorError::relay_transport("agent_stats", e.to_string()))
    }
}
