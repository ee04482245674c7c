//! Common types for KubeRDE: CRDs, agent identities, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod duration;
pub mod error;
pub mod identity;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use identity::AgentIdentity;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port for the relay's tunnel and management HTTP server
pub const DEFAULT_RELAY_PORT: u16 = 8080;

/// Default port for the relay's hostname-routed HTTP ingress
pub const DEFAULT_INGRESS_PORT: u16 = 8088;

/// Default port for the operator's scale-up webhook
pub const DEFAULT_WEBHOOK_PORT: u16 = 9443;

/// Path agents dial to open their tunnel session
pub const TUNNEL_PATH: &str = "/ws";

/// Label key carrying the workload identity on managed resources
pub const AGENT_ID_LABEL: &str = "kuberde.io/agent-id";

/// Annotation key carrying the workload identity on managed Deployments
pub const AGENT_ID_ANNOTATION: &str = "kuberde.io/agent-id";

/// Value of the `app` label on every managed Deployment
pub const AGENT_APP_LABEL: &str = "kuberde-agent";

/// Finalizer that guards route deregistration before workload teardown
pub const ROUTES_FINALIZER: &str = "kuberde.io/routes";

/// Cookie holding a browser user's session token
pub const SESSION_COOKIE: &str = "kuberde_session";

/// Environment variable carrying the agent's JSON service table
pub const SERVICES_ENV: &str = "KUBERDE_SERVICES";
