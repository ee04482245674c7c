//! Desired Deployment for an AgentWorkload
//!
//! One Deployment per workload, named after the workload identity. The pod
//! runs the user's `workload` container next to the `kuberde-agent` sidecar,
//! which dials the relay and bridges streams to the workload's ports.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec,
    ResourceRequirements, SecretKeySelector,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use serde::Serialize;

use kuberde_common::crd::{AgentWorkload, ServiceProtocol};
use kuberde_common::{AGENT_APP_LABEL, AGENT_ID_ANNOTATION, AGENT_ID_LABEL, SERVICES_ENV};

use crate::error::{OperatorError, Result};

/// Name of the agent sidecar container
pub const AGENT_CONTAINER: &str = "kuberde-agent";

/// Name of the user's container
pub const WORKLOAD_CONTAINER: &str = "workload";

/// Keys the agent reads from `spec.authSecret`
const SECRET_KEYS: [(&str, &str); 3] = [
    ("AUTH_CLIENT_ID", "client-id"),
    ("AUTH_CLIENT_SECRET", "client-secret"),
    ("AUTH_TOKEN_URL", "token-url"),
];

#[derive(Serialize)]
struct ServicesEnv<'a> {
    services: Vec<ServiceEnvEntry<'a>>,
}

#[derive(Serialize)]
struct ServiceEnvEntry<'a> {
    name: &'a str,
    port: u16,
    protocol: ServiceProtocol,
}

fn labels(identity: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), AGENT_APP_LABEL.to_string()),
        (AGENT_ID_LABEL.to_string(), identity.to_string()),
    ])
}

fn plain_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ])
}

fn agent_container(aw: &AgentWorkload, image: &str) -> Result<Container> {
    let identity = aw.identity();
    let services = ServicesEnv {
        services: aw
            .spec
            .services
            .iter()
            .map(|s| ServiceEnvEntry {
                name: &s.name,
                port: s.port,
                protocol: s.protocol,
            })
            .collect(),
    };
    let services = serde_json::to_string(&services)
        .map_err(|e| OperatorError::internal(format!("encoding {SERVICES_ENV}: {e}")))?;

    let mut env = vec![
        plain_env("SERVER_URL", aw.spec.server_url.clone()),
        plain_env("AGENT_ID", identity.as_str()),
        plain_env(SERVICES_ENV, services),
    ];
    if let Some(secret) = &aw.spec.auth_secret {
        env.extend(
            SECRET_KEYS
                .iter()
                .map(|(name, key)| secret_env(name, secret, key)),
        );
    }

    Ok(Container {
        name: AGENT_CONTAINER.to_string(),
        image: Some(image.to_string()),
        env: Some(env),
        resources: Some(ResourceRequirements {
            requests: Some(quantities("50m", "64Mi")),
            limits: Some(quantities("200m", "128Mi")),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn workload_container(aw: &AgentWorkload) -> Container {
    let spec = &aw.spec.workload_container;
    let ports: BTreeSet<u16> = aw
        .spec
        .services
        .iter()
        .map(|s| s.port)
        .chain(spec.ports.iter().copied())
        .collect();
    let env: Vec<EnvVar> = spec
        .env
        .iter()
        .map(|e| plain_env(&e.name, e.value.clone()))
        .collect();

    Container {
        name: WORKLOAD_CONTAINER.to_string(),
        image: Some(spec.image.clone()),
        command: spec.command.clone(),
        args: spec.args.clone(),
        env: (!env.is_empty()).then_some(env),
        ports: (!ports.is_empty()).then(|| {
            ports
                .into_iter()
                .map(|port| ContainerPort {
                    container_port: i32::from(port),
                    ..Default::default()
                })
                .collect()
        }),
        ..Default::default()
    }
}

/// Build the Deployment `aw` should have at `replicas`
pub fn desired_deployment(aw: &AgentWorkload, default_agent_image: &str, replicas: i32) -> Result<Deployment> {
    let identity = aw.identity();
    let namespace = aw
        .namespace()
        .ok_or_else(|| OperatorError::internal("AgentWorkload has no namespace"))?;
    let owner = aw
        .controller_owner_ref(&())
        .ok_or_else(|| OperatorError::internal("AgentWorkload has no uid"))?;
    let image = aw.spec.agent_image.as_deref().unwrap_or(default_agent_image);
    let labels = labels(identity.as_str());

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(identity.to_string()),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            annotations: Some(BTreeMap::from([(
                AGENT_ID_ANNOTATION.to_string(),
                identity.to_string(),
            )])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![workload_container(aw), agent_container(aw, image)?],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Replicas requested by a Deployment
pub fn replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
}

/// Ready replicas reported by a Deployment
pub fn ready_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

fn containers(deployment: &Deployment) -> &[Container] {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|p| p.containers.as_slice())
        .unwrap_or_default()
}

/// The parts of a container the operator owns
fn fingerprint(c: &Container) -> (&str, Option<&str>, Vec<&EnvVar>, Vec<i32>) {
    (
        c.name.as_str(),
        c.image.as_deref(),
        c.env.iter().flatten().collect(),
        c.ports.iter().flatten().map(|p| p.container_port).collect(),
    )
}

/// Whether `observed` already has everything `desired` sets
///
/// Compares replicas, labels, and each container's image, env and ports.
/// Fields the API server defaults are ignored.
pub fn deployment_matches(observed: &Deployment, desired: &Deployment) -> bool {
    if replicas(observed) != replicas(desired) {
        return false;
    }
    if observed.metadata.labels != desired.metadata.labels {
        return false;
    }
    let template_labels = |d: &Deployment| {
        d.spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.clone())
    };
    if template_labels(observed) != template_labels(desired) {
        return false;
    }

    let observed = containers(observed);
    let desired = containers(desired);
    observed.len() == desired.len()
        && observed
            .iter()
            .zip(desired)
            .all(|(o, d)| fingerprint(o) == fingerprint(d))
}
