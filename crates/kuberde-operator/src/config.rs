//! Operator configuration

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use kuberde_common::DEFAULT_WEBHOOK_PORT;

/// Default agent sidecar image
pub const DEFAULT_AGENT_IMAGE: &str = "ghcr.io/kuberde/kuberde-agent:latest";

/// KubeRDE operator
#[derive(Parser, Debug, Clone)]
#[command(name = "kuberde-operator", version, about, long_about = None)]
pub struct OperatorConfig {
    /// Print the AgentWorkload CRD as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Relay management API base URL
    #[arg(long, env = "KUBERDE_RELAY_URL", default_value = "http://kuberde-relay:8080")]
    pub relay_url: String,

    /// Agent sidecar image, unless a workload overrides it
    #[arg(long, env = "KUBERDE_AGENT_IMAGE", default_value = DEFAULT_AGENT_IMAGE)]
    pub agent_image: String,

    /// Address of the scale-up webhook
    #[arg(long, env = "KUBERDE_WEBHOOK_ADDR", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_WEBHOOK_PORT)))]
    pub webhook_addr: SocketAddr,

    /// Only watch this namespace
    #[arg(long, env = "KUBERDE_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Seconds between idle checks of a Ready workload
    #[arg(long, env = "KUBERDE_TICK_SECS", default_value_t = 60)]
    pub tick_secs: u64,

    /// OIDC issuer used to verify webhook callers
    #[arg(long, env = "KUBERDE_OIDC_ISSUER")]
    pub oidc_issuer: Option<String>,

    /// Accepted token audiences
    #[arg(long, env = "KUBERDE_OIDC_AUDIENCE", value_delimiter = ',')]
    pub oidc_audiences: Vec<String>,

    /// Static HS256 secret, for development without an identity provider
    #[arg(long, env = "KUBERDE_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Client id of the operator's system identity
    #[arg(long, env = "KUBERDE_SYSTEM_CLIENT_ID")]
    pub system_client_id: Option<String>,

    /// Client secret of the operator's system identity
    #[arg(long, env = "KUBERDE_SYSTEM_CLIENT_SECRET", hide_env_values = true)]
    pub system_client_secret: Option<String>,

    /// Token endpoint for the system identity
    #[arg(long, env = "KUBERDE_SYSTEM_TOKEN_URL")]
    pub system_token_url: Option<String>,

    /// Static system token, used when no client credentials are set
    #[arg(long, env = "KUBERDE_SYSTEM_TOKEN", hide_env_values = true)]
    pub system_token: Option<String>,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "KUBERDE_LOG_PRETTY")]
    pub log_pretty: bool,
}

impl OperatorConfig {
    /// Requeue interval for Ready and Idle workloads
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }
}
