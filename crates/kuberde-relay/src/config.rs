//! Relay configuration
//!
//! Every flag can also be set through its environment variable, which is how
//! the relay is configured in-cluster.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use kuberde_common::{DEFAULT_INGRESS_PORT, DEFAULT_RELAY_PORT};
use kuberde_mux::SessionConfig;

/// KubeRDE relay server
#[derive(Parser, Debug, Clone)]
#[command(name = "kuberde-relay", version, about, long_about = None)]
pub struct RelayConfig {
    /// Address for the tunnel endpoint, management API and auth endpoints
    #[arg(long, env = "KUBERDE_LISTEN_ADDR", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_RELAY_PORT)))]
    pub listen_addr: SocketAddr,

    /// Address for hostname-routed HTTP ingress
    #[arg(long, env = "KUBERDE_INGRESS_ADDR", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_INGRESS_PORT)))]
    pub ingress_addr: SocketAddr,

    /// Interface TCP route listeners bind to
    #[arg(long, env = "KUBERDE_TCP_BIND_HOST", default_value = "0.0.0.0")]
    pub tcp_bind_host: IpAddr,

    /// Domain under which `{service}.{identity}` hosts are derived without an explicit route
    #[arg(long, env = "KUBERDE_AGENT_DOMAIN")]
    pub agent_domain: Option<String>,

    /// Externally visible base URL, used for login redirects
    #[arg(long, env = "KUBERDE_PUBLIC_URL", default_value = "http://localhost:8080")]
    pub public_url: String,

    /// OIDC issuer; enables JWKS verification and browser login
    #[arg(long, env = "KUBERDE_OIDC_ISSUER")]
    pub oidc_issuer: Option<String>,

    /// Accepted token audiences
    #[arg(long, env = "KUBERDE_OIDC_AUDIENCE", value_delimiter = ',')]
    pub oidc_audiences: Vec<String>,

    /// Client id for browser login
    #[arg(long, env = "KUBERDE_OIDC_CLIENT_ID", default_value = "kuberde-cli")]
    pub oidc_client_id: String,

    /// Client secret for browser login
    #[arg(long, env = "KUBERDE_OIDC_CLIENT_SECRET", hide_env_values = true)]
    pub oidc_client_secret: Option<String>,

    /// Static HS256 secret, for development without an identity provider
    #[arg(long, env = "KUBERDE_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Operator scale-up webhook, e.g. `http://kuberde-operator:9443/scale-up`
    #[arg(long, env = "KUBERDE_SCALE_UP_URL")]
    pub scale_up_url: Option<String>,

    /// Client id of the relay's system identity
    #[arg(long, env = "KUBERDE_SYSTEM_CLIENT_ID")]
    pub system_client_id: Option<String>,

    /// Client secret of the relay's system identity
    #[arg(long, env = "KUBERDE_SYSTEM_CLIENT_SECRET", hide_env_values = true)]
    pub system_client_secret: Option<String>,

    /// Token endpoint for the system identity
    #[arg(long, env = "KUBERDE_SYSTEM_TOKEN_URL")]
    pub system_token_url: Option<String>,

    /// Static system token, used when no client credentials are set
    #[arg(long, env = "KUBERDE_SYSTEM_TOKEN", hide_env_values = true)]
    pub system_token: Option<String>,

    /// Seconds between tunnel heartbeats
    #[arg(long, env = "KUBERDE_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Seconds without inbound frames before a session is dropped
    #[arg(long, env = "KUBERDE_SESSION_IDLE_SECS", default_value_t = 90)]
    pub session_idle_secs: u64,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "KUBERDE_LOG_PRETTY")]
    pub log_pretty: bool,
}

impl RelayConfig {
    /// Tunnel session tuning
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            idle_timeout: Duration::from_secs(self.session_idle_secs),
            ..Default::default()
        }
    }

    /// Ports a TCP route may never claim
    pub fn reserved_ports(&self) -> Vec<u16> {
        vec![self.listen_addr.port(), self.ingress_addr.port()]
    }

    /// Whether cookies should carry `Secure`
    pub fn secure_cookies(&self) -> bool {
        self.public_url.starts_with("https://")
    }

    /// Agent domain normalised to lowercase without a leading dot
    pub fn normalized_agent_domain(&self) -> Option<String> {
        self.agent_domain
            .as_deref()
            .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RelayConfig::parse_from(["kuberde-relay"]);
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.ingress_addr.port(), 8088);
        assert_eq!(config.reserved_ports(), vec![8080, 8088]);
        assert_eq!(config.session_config().idle_timeout, Duration::from_secs(90));
        assert!(!config.secure_cookies());
    }

    #[test]
    fn agent_domain_is_normalised() {
        let config = RelayConfig::parse_from([
            "kuberde-relay",
            "--agent-domain",
            ".RDE.Example.com",
            "--public-url",
            "https://rde.example.com",
        ]);
        assert_eq!(
            config.normalized_agent_domain().as_deref(),
            Some("rde.example.com")
        );
        assert!(config.secure_cookies());
    }
}
