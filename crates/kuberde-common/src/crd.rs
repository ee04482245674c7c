//! AgentWorkload CRD types
//!
//! An `AgentWorkload` declares one user's development pod: the workload
//! container, the services the agent exposes through the relay, and how long
//! the pod may sit idle before it is scaled to zero.

use std::collections::HashSet;
use std::time::Duration;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::{AgentIdentity, Error, Result};

/// Maximum length of a workload identity (label values are capped at 63)
const MAX_WORKLOAD_IDENTITY_LEN: usize = 63;

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of an AgentWorkload
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AgentWorkloadPhase {
    /// Accepted, nothing reconciled yet
    #[default]
    Pending,
    /// Converging the Deployment and routes
    Reconciling,
    /// Deployment running and routes active
    Ready,
    /// Scaled to zero after the TTL elapsed, routes parked
    Idle,
    /// Deletion in progress
    Terminating,
    /// Reconciliation failed; see status message
    Error,
}

impl std::fmt::Display for AgentWorkloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Reconciling => write!(f, "Reconciling"),
            Self::Ready => write!(f, "Ready"),
            Self::Idle => write!(f, "Idle"),
            Self::Terminating => write!(f, "Terminating"),
            Self::Error => write!(f, "Error"),
        }
    }
}

// =============================================================================
// Services
// =============================================================================

/// How the relay reaches a service
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ServiceProtocol {
    /// Raw TCP, routed by external port
    #[serde(rename = "TCP")]
    Tcp,
    /// HTTP, routed by hostname prefix
    #[serde(rename = "HTTP")]
    Http,
}

impl std::fmt::Display for ServiceProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Http => write!(f, "HTTP"),
        }
    }
}

/// A service exposed by the agent
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Service name, unique within the workload; also the preamble selector
    pub name: String,
    /// Port the service listens on inside the pod
    pub port: u16,
    /// Routing protocol
    pub protocol: ServiceProtocol,
    /// Relay port for TCP services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_port: Option<u16>,
}

// =============================================================================
// Workload container
// =============================================================================

/// A plain name/value environment variable for the workload container
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EnvVarSpec {
    /// Variable name
    pub name: String,
    /// Variable value
    #[serde(default)]
    pub value: String,
}

/// The user's workload container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadContainer {
    /// Container image
    pub image: String,
    /// Additional container ports beyond those implied by services
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    /// Entrypoint override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// Arguments override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVarSpec>,
}

// =============================================================================
// CRD
// =============================================================================

/// A user's agent-backed development workload
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kuberde.io",
    version = "v1beta1",
    kind = "AgentWorkload",
    plural = "agentworkloads",
    shortname = "aw",
    namespaced,
    status = "AgentWorkloadStatus",
    printcolumn = r#"{"name":"Owner","type":"string","jsonPath":".spec.owner"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"TTL","type":"string","jsonPath":".spec.ttl"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AgentWorkloadSpec {
    /// Owning user; embedded in the agent identity
    pub owner: String,

    /// Relay tunnel endpoint the agent dials (e.g. `ws://kuberde-relay:8080/ws`)
    pub server_url: String,

    /// Services exposed through the relay, in declaration order
    #[serde(default)]
    pub services: Vec<ServiceSpec>,

    /// The user's workload container
    pub workload_container: WorkloadContainer,

    /// Idle time before scale-to-zero (e.g. "30m"); absent or "0" disables it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,

    /// Secret with the agent's `client-id`, `client-secret` and `token-url`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret: Option<String>,

    /// Agent image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_image: Option<String>,
}

/// Status of an AgentWorkload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentWorkloadStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: AgentWorkloadPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last observed user activity (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,

    /// Generation of the spec last reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Workload identity the agent registers under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    /// Ready replicas of the managed Deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,
}

impl AgentWorkloadSpec {
    /// Validate the spec for the workload named `name`
    ///
    /// The structural schema already rejects wrongly-typed fields; this
    /// catches what a schema cannot express.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.owner.is_empty()
            || !self
                .owner
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(Error::validation_for_field(
                name,
                "spec.owner",
                "owner must be non-empty lowercase alphanumerics without '-'",
            ));
        }

        let identity = AgentIdentity::for_workload(&self.owner, name);
        AgentIdentity::parse(identity.as_str())
            .map_err(|e| Error::validation_for_field(name, "metadata.name", e.to_string()))?;
        if identity.as_str().len() > MAX_WORKLOAD_IDENTITY_LEN {
            return Err(Error::validation_for_field(
                name,
                "metadata.name",
                format!(
                    "identity '{}' exceeds {} characters",
                    identity, MAX_WORKLOAD_IDENTITY_LEN
                ),
            ));
        }

        if self.server_url.is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.serverUrl",
                "serverUrl is required",
            ));
        }
        if self.workload_container.image.is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.workloadContainer.image",
                "image is required",
            ));
        }

        let mut seen = HashSet::new();
        let mut external_ports = HashSet::new();
        for (i, svc) in self.services.iter().enumerate() {
            let field = |f: &str| format!("spec.services[{}].{}", i, f);
            if !is_dns_label(&svc.name) {
                return Err(Error::validation_for_field(
                    name,
                    field("name"),
                    format!("service name '{}' must be a DNS label", svc.name),
                ));
            }
            if !seen.insert(svc.name.as_str()) {
                return Err(Error::validation_for_field(
                    name,
                    field("name"),
                    format!("duplicate service name '{}'", svc.name),
                ));
            }
            if svc.port == 0 {
                return Err(Error::validation_for_field(
                    name,
                    field("port"),
                    "port must be 1-65535",
                ));
            }
            match (svc.protocol, svc.external_port) {
                (ServiceProtocol::Tcp, None) | (ServiceProtocol::Tcp, Some(0)) => {
                    return Err(Error::validation_for_field(
                        name,
                        field("externalPort"),
                        "TCP services require an externalPort in 1-65535",
                    ));
                }
                (ServiceProtocol::Tcp, Some(p)) if !external_ports.insert(p) => {
                    return Err(Error::validation_for_field(
                        name,
                        field("externalPort"),
                        format!("externalPort {} is used twice", p),
                    ));
                }
                _ => {}
            }
        }

        self.ttl_duration()
            .map_err(|e| Error::validation_for_field(name, "spec.ttl", e.to_string()))?;
        Ok(())
    }

    /// Parsed TTL; `None` when idle scaling is disabled
    pub fn ttl_duration(&self) -> Result<Option<Duration>> {
        match self.ttl.as_deref() {
            None => Ok(None),
            Some(raw) => {
                let ttl = parse_duration(raw)?;
                Ok((!ttl.is_zero()).then_some(ttl))
            }
        }
    }
}

impl AgentWorkload {
    /// Workload identity: `user-{owner}-{name}`
    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity::for_workload(&self.spec.owner, &self.name_any())
    }

    /// Current phase, defaulting to Pending when no status exists yet
    pub fn phase(&self) -> AgentWorkloadPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}

/// RFC 1123 label: lowercase alphanumerics and '-', 1-63 chars, alnum edges
pub fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn sample_spec() -> AgentWorkloadSpec {
        AgentWorkloadSpec {
            owner: "alice".to_string(),
            server_url: "ws://kuberde-relay:8080/ws".to_string(),
            services: vec![
                ServiceSpec {
                    name: "ssh".to_string(),
                    port: 22,
                    protocol: ServiceProtocol::Tcp,
                    external_port: Some(2222),
                },
                ServiceSpec {
                    name: "files".to_string(),
                    port: 8080,
                    protocol: ServiceProtocol::Http,
                    external_port: None,
                },
            ],
            workload_container: WorkloadContainer {
                image: "ghcr.io/kuberde/workspace:latest".to_string(),
                ..Default::default()
            },
            ttl: Some("30m".to_string()),
            auth_secret: None,
            agent_image: None,
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(sample_spec().validate("ws").is_ok());
    }

    #[test]
    fn duplicate_service_names_are_rejected() {
        let mut spec = sample_spec();
        spec.services[1].name = "ssh".to_string();
        spec.services[1].protocol = ServiceProtocol::Http;
        let err = spec.validate("ws").unwrap_err();
        assert_eq!(err.field(), Some("spec.services[1].name"));
    }

    #[test]
    fn tcp_service_requires_external_port() {
        let mut spec = sample_spec();
        spec.services[0].external_port = None;
        let err = spec.validate("ws").unwrap_err();
        assert_eq!(err.field(), Some("spec.services[0].externalPort"));
    }

    #[test]
    fn owner_with_dash_is_rejected() {
        let mut spec = sample_spec();
        spec.owner = "alice-smith".to_string();
        assert_eq!(spec.validate("ws").unwrap_err().field(), Some("spec.owner"));
    }

    #[test]
    fn bad_ttl_is_rejected_and_zero_disables() {
        let mut spec = sample_spec();
        spec.ttl = Some("soon".to_string());
        assert_eq!(spec.validate("ws").unwrap_err().field(), Some("spec.ttl"));

        spec.ttl = Some("0".to_string());
        assert_eq!(spec.ttl_duration().unwrap(), None);
        spec.ttl = None;
        assert_eq!(spec.ttl_duration().unwrap(), None);
        spec.ttl = Some("30m".to_string());
        assert_eq!(
            spec.ttl_duration().unwrap(),
            Some(Duration::from_secs(1800))
        );
    }

    #[test]
    fn identity_derives_from_owner_and_name() {
        let aw = AgentWorkload::new("ws", sample_spec());
        assert_eq!(aw.identity().as_str(), "user-alice-ws");
        assert_eq!(aw.phase(), AgentWorkloadPhase::Pending);
    }

    #[test]
    fn malformed_protocol_is_rejected_at_parse_time() {
        let json = serde_json::json!({
            "owner": "alice",
            "serverUrl": "ws://relay/ws",
            "services": [{"name": "ssh", "port": 22, "protocol": "UDP"}],
            "workloadContainer": {"image": "img"}
        });
        assert!(serde_json::from_value::<AgentWorkloadSpec>(json).is_err());
    }

    #[test]
    fn crd_generates_with_expected_names() {
        let crd = AgentWorkload::crd();
        assert_eq!(crd.spec.group, "kuberde.io");
        assert_eq!(crd.spec.names.kind, "AgentWorkload");
        assert_eq!(crd.spec.names.plural, "agentworkloads");
        let yaml = serde_yaml::to_string(&crd).unwrap();
        assert!(yaml.contains("workloadContainer"));
    }
}
