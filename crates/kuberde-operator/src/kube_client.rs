//! Kubernetes access for the controller and the webhook
//!
//! Everything the operator reads or writes in the API server goes through
//! [`KubeClient`] so reconcile logic can be exercised with a mock.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kuberde_common::crd::{AgentWorkload, AgentWorkloadStatus};
use kuberde_common::retry::{retry_with_backoff, RetryConfig};
use kuberde_common::AgentIdentity;

use crate::error::{OperatorError, Result};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "kuberde-operator";

/// Kubernetes operations the operator performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Deployment; `None` when it does not exist
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Server-side apply a Deployment
    async fn apply_deployment(&self, deployment: &Deployment) -> Result<()>;

    /// Delete a Deployment; a missing Deployment is not an error
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    /// Replace the status of an AgentWorkload
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AgentWorkloadStatus,
    ) -> Result<()>;

    /// Add `finalizer` unless present
    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()>;

    /// Remove `finalizer` if present
    async fn remove_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()>;

    /// The AgentWorkload owning `identity`, which may be a workload or a
    /// per-service identity; see [`select_workload`]
    async fn find_workload(&self, identity: &AgentIdentity) -> Result<Option<AgentWorkload>>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn workloads(&self, namespace: &str) -> Api<AgentWorkload> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn set_finalizers(&self, namespace: &str, name: &str, finalizers: Vec<String>) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        self.workloads(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Whether `aw` owns `identity`
pub fn owns_identity(aw: &AgentWorkload, identity: &AgentIdentity) -> bool {
    let workload = aw.identity();
    workload == *identity
        || aw
            .spec
            .services
            .iter()
            .any(|svc| workload.for_service(&svc.name) == *identity)
}

/// The workload owning `identity` among `workloads`
///
/// Workload `ws` with service `x` and workload `ws-x` both own the string
/// `user-{owner}-ws-x`. A workload whose own identity matches wins over a
/// per-service match.
pub fn select_workload(
    workloads: impl IntoIterator<Item = AgentWorkload>,
    identity: &AgentIdentity,
) -> Option<AgentWorkload> {
    let mut by_service = None;
    for aw in workloads {
        if aw.identity() == *identity {
            return Some(aw);
        }
        if by_service.is_none() && owns_identity(&aw, identity) {
            by_service = Some(aw);
        }
    }
    by_service
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.deployments(namespace).get_opt(name).await?)
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<()> {
        let namespace = deployment
            .namespace()
            .ok_or_else(|| OperatorError::internal("Deployment has no namespace"))?;
        let name = deployment.name_any();
        self.deployments(&namespace)
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(deployment),
            )
            .await?;
        debug!(deployment = %name, namespace = %namespace, "Applied Deployment");
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .deployments(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AgentWorkloadStatus,
    ) -> Result<()> {
        let api = self.workloads(namespace);
        let patch = serde_json::json!({ "status": status });
        retry_with_backoff(
            &RetryConfig::for_status_updates(),
            "patch_status",
            || {
                let api = api.clone();
                let patch = patch.clone();
                let name = name.to_string();
                async move {
                    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await
                        .map(|_| ())
                }
            },
        )
        .await?;
        Ok(())
    }

    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()> {
        let aw = self.workloads(namespace).get(name).await?;
        let mut finalizers = aw.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.set_finalizers(namespace, name, finalizers).await
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()> {
        let Some(aw) = self.workloads(namespace).get_opt(name).await? else {
            return Ok(());
        };
        let finalizers: Vec<String> = aw
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();
        self.set_finalizers(namespace, name, finalizers).await
    }

    async fn find_workload(&self, identity: &AgentIdentity) -> Result<Option<AgentWorkload>> {
        let api: Api<AgentWorkload> = Api::all(self.client.clone());
        let workloads = api.list(&ListParams::default()).await?;
        Ok(select_workload(workloads.items, identity))
    }
}

#[cfg(test)]
mod tests {
    use kuberde_common::crd::{AgentWorkloadSpec, ServiceProtocol, ServiceSpec, WorkloadContainer};

    use super::*;

    fn workload(name: &str, services: &[&str]) -> AgentWorkload {
        AgentWorkload::new(
            name,
            AgentWorkloadSpec {
                owner: "alice".into(),
                server_url: "ws://relay/ws".into(),
                services: services
                    .iter()
                    .map(|svc| ServiceSpec {
                        name: svc.to_string(),
                        port: 22,
                        protocol: ServiceProtocol::Tcp,
                        external_port: Some(2222),
                    })
                    .collect(),
                workload_container: WorkloadContainer {
                    image: "ubuntu".into(),
                    ..Default::default()
                },
                ttl: None,
                auth_secret: None,
                agent_image: None,
            },
        )
    }

    fn id(raw: &str) -> AgentIdentity {
        AgentIdentity::parse(raw).unwrap()
    }

    #[test]
    fn workload_and_service_identities_resolve_to_owner() {
        let aw = workload("ws", &["ssh"]);
        assert!(owns_identity(&aw, &id("user-alice-ws")));
        assert!(owns_identity(&aw, &id("user-alice-ws-ssh")));
        assert!(!owns_identity(&aw, &id("user-alice-ws-files")));
        assert!(!owns_identity(&aw, &id("user-bob-ws")));
    }

    #[test]
    fn exact_workload_identity_beats_service_identity() {
        // `ws` serves `x`, so both spell user-alice-ws-x
        let ws = workload("ws", &["x"]);
        let ws_x = workload("ws-x", &["ssh"]);

        for order in [vec![ws.clone(), ws_x.clone()], vec![ws_x.clone(), ws.clone()]] {
            let found = select_workload(order, &id("user-alice-ws-x")).unwrap();
            assert_eq!(found.name_any(), "ws-x");
        }

        let found = select_workload(vec![ws_x, ws], &id("user-alice-ws")).unwrap();
        assert_eq!(found.name_any(), "ws");
        assert!(select_workload(Vec::new(), &id("user-alice-ws")).is_none());
    }

    #[test]
    fn service_identity_falls_back_to_its_workload() {
        let found = select_workload(
            vec![workload("lab", &[]), workload("ws", &["ssh"])],
            &id("user-alice-ws-ssh"),
        )
        .unwrap();
        assert_eq!(found.name_any(), "ws");
    }
}
