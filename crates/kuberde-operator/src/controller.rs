//! AgentWorkload controller
//!
//! Each pass converges one AgentWorkload: the finalizer, the agent
//! Deployment, the relay routes and the status. Calls are only issued for
//! what differs, so a converged workload costs reads only.
//!
//! Phases move `Pending -> Reconciling -> Ready -> Idle -> Reconciling -> ...`
//! with `Terminating` once the resource is deleted. Idle workloads run zero
//! replicas and their routes stay parked until the scale-up webhook wakes
//! them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use kuberde_common::crd::{AgentWorkload, AgentWorkloadPhase, AgentWorkloadStatus};
use kuberde_common::ROUTES_FINALIZER;

use crate::error::{OperatorError, Result};
use crate::kube_client::KubeClient;
use crate::relay_client::RelayApi;
use crate::routes::{desired_routes, observed_key, plan, RouteAction, RouteKey};
use crate::ttl::{effective_last_activity, parse_activity, should_record, should_scale_down};
use crate::workload::{deployment_matches, desired_deployment, ready_replicas};

/// Requeue while the agent pod starts
pub const STARTING_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue after a failed pass
pub const ERROR_REQUEUE: Duration = Duration::from_secs(30);

const READY_MESSAGE: &str = "Agent running, routes active";
const STARTING_MESSAGE: &str = "Waiting for the agent pod";
const IDLE_MESSAGE: &str = "Scaled to zero after idle TTL, routes parked";
const TERMINATING_MESSAGE: &str = "Removing routes and Deployment";

/// Tunables that are not part of any AgentWorkload
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    /// Agent image when the workload does not override it
    pub agent_image: String,
    /// Requeue interval for Ready and Idle workloads; drives idle checks
    pub tick: Duration,
}

/// Controller context shared by every reconcile
pub struct Context {
    /// Kubernetes access
    pub kube: Arc<dyn KubeClient>,
    /// Relay management API
    pub relay: Arc<dyn RelayApi>,
    /// Settings
    pub settings: ControllerSettings,
}

impl Context {
    /// Create a context
    pub fn new(kube: Arc<dyn KubeClient>, relay: Arc<dyn RelayApi>, settings: ControllerSettings) -> Self {
        Self {
            kube,
            relay,
            settings,
        }
    }
}

/// Reconcile one AgentWorkload
#[instrument(skip(aw, ctx), fields(workload = %aw.name_any()))]
pub async fn reconcile(aw: Arc<AgentWorkload>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = aw
        .namespace()
        .ok_or_else(|| OperatorError::internal("AgentWorkload has no namespace"))?;

    if aw.metadata.deletion_timestamp.is_some() {
        return cleanup(&aw, &namespace, &ctx).await;
    }

    if let Err(e) = aw.spec.validate(&aw.name_any()) {
        warn!(error = %e, "AgentWorkload is invalid");
        let status = next_status(&aw, AgentWorkloadPhase::Error, e.to_string());
        write_status(&aw, &namespace, &ctx, status).await?;
        return Ok(Action::await_change());
    }

    match converge(&aw, &namespace, &ctx).await {
        Ok(action) => Ok(action),
        Err(e) => {
            record_failure(&aw, &namespace, &ctx, &e).await;
            Err(e)
        }
    }
}

/// Requeue policy for failed passes
pub fn error_policy(aw: Arc<AgentWorkload>, error: &OperatorError, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        workload = %aw.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

async fn converge(aw: &AgentWorkload, namespace: &str, ctx: &Context) -> Result<Action> {
    let identity = aw.identity();
    let idle = aw.phase() == AgentWorkloadPhase::Idle;

    if !aw.finalizers().iter().any(|f| f == ROUTES_FINALIZER) {
        ctx.kube
            .add_finalizer(namespace, &aw.name_any(), ROUTES_FINALIZER)
            .await?;
    }

    let replicas = if idle { 0 } else { 1 };
    let desired = desired_deployment(aw, &ctx.settings.agent_image, replicas)?;
    let observed = ctx.kube.get_deployment(namespace, identity.as_str()).await?;
    if !observed
        .as_ref()
        .is_some_and(|o| deployment_matches(o, &desired))
    {
        info!(replicas, "Applying agent Deployment");
        ctx.kube.apply_deployment(&desired).await?;
    }
    let ready = observed.as_ref().map(ready_replicas).unwrap_or(0);

    let routes = desired_routes(aw);
    let listed = ctx.relay.list_routes(&identity).await?;
    apply_routes(ctx.relay.as_ref(), &plan(&routes, &listed, idle)).await?;

    if idle {
        let mut status = next_status(aw, AgentWorkloadPhase::Idle, IDLE_MESSAGE);
        status.ready_replicas = Some(ready);
        write_status(aw, namespace, ctx, status).await?;
        return Ok(Action::requeue(ctx.settings.tick));
    }

    if ready < 1 {
        let mut status = next_status(aw, AgentWorkloadPhase::Reconciling, STARTING_MESSAGE);
        status.ready_replicas = Some(ready);
        write_status(aw, namespace, ctx, status).await?;
        return Ok(Action::requeue(STARTING_REQUEUE));
    }

    let mut status = next_status(aw, AgentWorkloadPhase::Ready, READY_MESSAGE);
    status.ready_replicas = Some(ready);

    if let Some(ttl) = aw.spec.ttl_duration()? {
        let now = Utc::now();
        let stored = parse_activity(status.last_activity.as_deref());
        let stats = ctx.relay.agent_stats(&identity).await?;
        let last = effective_last_activity(stored, stats.as_ref(), now, now);

        if should_scale_down(last, ttl, now) {
            info!(last_activity = %last, ?ttl, "Idle TTL elapsed, scaling to zero");
            let park: Vec<RouteAction> = routes.keys().cloned().map(RouteAction::Park).collect();
            apply_routes(ctx.relay.as_ref(), &park).await?;
            ctx.kube
                .apply_deployment(&desired_deployment(aw, &ctx.settings.agent_image, 0)?)
                .await?;

            let mut status = next_status(aw, AgentWorkloadPhase::Idle, IDLE_MESSAGE);
            status.ready_replicas = Some(0);
            status.last_activity = Some(last.to_rfc3339());
            write_status(aw, namespace, ctx, status).await?;
            return Ok(Action::requeue(ctx.settings.tick));
        }

        if should_record(stored, last) {
            status.last_activity = Some(last.to_rfc3339());
        }
    }

    write_status(aw, namespace, ctx, status).await?;
    Ok(Action::requeue(ctx.settings.tick))
}

/// Deletion: routes first, then the Deployment, then the finalizer
async fn cleanup(aw: &AgentWorkload, namespace: &str, ctx: &Context) -> Result<Action> {
    if !aw.finalizers().iter().any(|f| f == ROUTES_FINALIZER) {
        return Ok(Action::await_change());
    }
    let identity = aw.identity();
    info!(%identity, "AgentWorkload deleted, releasing routes");

    let status = next_status(aw, AgentWorkloadPhase::Terminating, TERMINATING_MESSAGE);
    write_status(aw, namespace, ctx, status).await?;

    let remove: Vec<RouteAction> = ctx
        .relay
        .list_routes(&identity)
        .await?
        .iter()
        .filter_map(observed_key)
        .map(RouteAction::Remove)
        .collect();
    apply_routes(ctx.relay.as_ref(), &remove).await?;

    ctx.kube
        .delete_deployment(namespace, identity.as_str())
        .await?;
    ctx.kube
        .remove_finalizer(namespace, &aw.name_any(), ROUTES_FINALIZER)
        .await?;
    Ok(Action::await_change())
}

async fn apply_routes(relay: &dyn RelayApi, actions: &[RouteAction]) -> Result<()> {
    for action in actions {
        debug!(?action, "Updating relay route");
        match action {
            RouteAction::Register(RouteKey::Tcp(port), target) => {
                relay
                    .register_tcp(&target.identity, &target.service, *port)
                    .await?
            }
            RouteAction::Register(RouteKey::Http(prefix), target) => {
                relay
                    .register_http(&target.identity, &target.service, prefix)
                    .await?
            }
            RouteAction::Park(RouteKey::Tcp(port)) => relay.deregister_tcp(*port, true).await?,
            RouteAction::Park(RouteKey::Http(prefix)) => relay.deregister_http(prefix, true).await?,
            RouteAction::Remove(RouteKey::Tcp(port)) => relay.deregister_tcp(*port, false).await?,
            RouteAction::Remove(RouteKey::Http(prefix)) => {
                relay.deregister_http(prefix, false).await?
            }
        }
    }
    Ok(())
}

fn next_status(aw: &AgentWorkload, phase: AgentWorkloadPhase, message: impl Into<String>) -> AgentWorkloadStatus {
    AgentWorkloadStatus {
        phase,
        message: Some(message.into()),
        observed_generation: aw.metadata.generation,
        identity: Some(aw.identity().to_string()),
        ..aw.status.clone().unwrap_or_default()
    }
}

async fn write_status(
    aw: &AgentWorkload,
    namespace: &str,
    ctx: &Context,
    status: AgentWorkloadStatus,
) -> Result<()> {
    if aw.status.as_ref() == Some(&status) {
        return Ok(());
    }
    debug!(phase = %status.phase, "Updating status");
    ctx.kube.patch_status(namespace, &aw.name_any(), &status).await
}

/// Surface a failed pass on the resource
///
/// Idle workloads keep their phase so the next pass does not wake them.
async fn record_failure(aw: &AgentWorkload, namespace: &str, ctx: &Context, e: &OperatorError) {
    let phase = match aw.phase() {
        AgentWorkloadPhase::Idle => AgentWorkloadPhase::Idle,
        _ => AgentWorkloadPhase::Error,
    };
    let status = next_status(aw, phase, format!("Reconcile failed: {e}"));
    if let Err(patch_err) = write_status(aw, namespace, ctx, status).await {
        warn!(error = %patch_err, "Failed to record reconcile error in status");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::{DateTime, Duration as ChronoDuration};
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kuberde_common::crd::{AgentWorkloadSpec, ServiceProtocol, ServiceSpec, WorkloadContainer};
    use kuberde_common::AgentIdentity;

    use super::*;
    use crate::kube_client::MockKubeClient;
    use crate::relay_client::{AgentStats, MockRelayApi, ObservedRoute, RouteState};
    use crate::workload::replicas;

    const TICK: Duration = Duration::from_secs(60);

    // ===== Fixtures =====

    fn workload(phase: Option<AgentWorkloadPhase>, last_activity: Option<DateTime<Utc>>) -> AgentWorkload {
        let mut aw = AgentWorkload::new(
            "ws",
            AgentWorkloadSpec {
                owner: "alice".into(),
                server_url: "ws://kuberde-relay:8080/ws".into(),
                services: vec![
                    ServiceSpec {
                        name: "ssh".into(),
                        port: 22,
                        protocol: ServiceProtocol::Tcp,
                        external_port: Some(2222),
                    },
                    ServiceSpec {
                        name: "files".into(),
                        port: 8080,
                        protocol: ServiceProtocol::Http,
                        external_port: None,
                    },
                ],
                workload_container: WorkloadContainer {
                    image: "ubuntu:24.04".into(),
                    ..Default::default()
                },
                ttl: Some("30m".into()),
                auth_secret: Some("alice-agent".into()),
                agent_image: None,
            },
        );
        aw.metadata.namespace = Some("dev".into());
        aw.metadata.uid = Some("uid-1".into());
        aw.metadata.generation = Some(1);
        aw.metadata.finalizers = Some(vec![ROUTES_FINALIZER.into()]);
        aw.status = phase.map(|phase| AgentWorkloadStatus {
            phase,
            message: Some(
                match phase {
                    AgentWorkloadPhase::Ready => READY_MESSAGE,
                    AgentWorkloadPhase::Idle => IDLE_MESSAGE,
                    _ => STARTING_MESSAGE,
                }
                .into(),
            ),
            last_activity: last_activity.map(|t| t.to_rfc3339()),
            observed_generation: Some(1),
            identity: Some("user-alice-ws".into()),
            ready_replicas: Some(match phase {
                AgentWorkloadPhase::Idle => 0,
                _ => 1,
            }),
        });
        aw
    }

    fn deployment(aw: &AgentWorkload, replicas: i32, ready: i32) -> Deployment {
        let mut d = desired_deployment(aw, "agent:1", replicas).unwrap();
        d.status = Some(DeploymentStatus {
            ready_replicas: Some(ready),
            ..Default::default()
        });
        d
    }

    fn route(kind: &str, identity: &str, service: &str, state: RouteState) -> ObservedRoute {
        ObservedRoute {
            kind: kind.into(),
            port: (kind == "TCP").then_some(2222),
            hostname_prefix: (kind == "HTTP").then(|| "files.user-alice-ws".to_string()),
            agent_id: AgentIdentity::parse(identity).unwrap(),
            service: service.into(),
            state,
        }
    }

    fn routes(state: RouteState) -> Vec<ObservedRoute> {
        vec![
            route("TCP", "user-alice-ws-ssh", "ssh", state),
            route("HTTP", "user-alice-ws-files", "files", state),
        ]
    }

    fn quiet_stats(last: DateTime<Utc>, active_connections: usize) -> AgentStats {
        AgentStats {
            online: true,
            last_activity: last,
            has_active_session: true,
            active_connections,
        }
    }

    fn context(kube: MockKubeClient, relay: MockRelayApi) -> Arc<Context> {
        Arc::new(Context::new(
            Arc::new(kube),
            Arc::new(relay),
            ControllerSettings {
                agent_image: "agent:1".into(),
                tick: TICK,
            },
        ))
    }

    /// Ordered log of mutating calls across both clients
    #[derive(Clone, Default)]
    struct CallLog(Arc<Mutex<Vec<String>>>);

    impl CallLog {
        fn push(&self, call: impl Into<String>) {
            self.0.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    /// Relay mock that logs every mutating call
    fn logging_relay(log: &CallLog, listed: Vec<ObservedRoute>, stats: Option<AgentStats>) -> MockRelayApi {
        let mut relay = MockRelayApi::new();
        relay
            .expect_list_routes()
            .returning(move |_| Ok(listed.clone()));
        relay
            .expect_agent_stats()
            .returning(move |_| Ok(stats.clone()));
        let l = log.clone();
        relay.expect_register_tcp().returning(move |id, _, port| {
            l.push(format!("register tcp:{port} -> {id}"));
            Ok(())
        });
        let l = log.clone();
        relay.expect_register_http().returning(move |id, _, prefix| {
            l.push(format!("register http:{prefix} -> {id}"));
            Ok(())
        });
        let l = log.clone();
        relay.expect_deregister_tcp().returning(move |port, park| {
            l.push(format!("{} tcp:{port}", if park { "park" } else { "remove" }));
            Ok(())
        });
        let l = log.clone();
        relay.expect_deregister_http().returning(move |prefix, park| {
            l.push(format!("{} http:{prefix}", if park { "park" } else { "remove" }));
            Ok(())
        });
        relay
    }

    /// Kube mock that logs every mutating call
    fn logging_kube(log: &CallLog, observed: Option<Deployment>) -> MockKubeClient {
        let mut kube = MockKubeClient::new();
        kube.expect_get_deployment()
            .returning(move |_, _| Ok(observed.clone()));
        let l = log.clone();
        kube.expect_apply_deployment().returning(move |d| {
            l.push(format!("apply replicas={}", replicas(d)));
            Ok(())
        });
        let l = log.clone();
        kube.expect_patch_status().returning(move |_, _, status| {
            l.push(format!("status {}", status.phase));
            Ok(())
        });
        let l = log.clone();
        kube.expect_add_finalizer().returning(move |_, _, f| {
            l.push(format!("add finalizer {f}"));
            Ok(())
        });
        let l = log.clone();
        kube.expect_delete_deployment().returning(move |_, name| {
            l.push(format!("delete deployment {name}"));
            Ok(())
        });
        let l = log.clone();
        kube.expect_remove_finalizer().returning(move |_, _, f| {
            l.push(format!("remove finalizer {f}"));
            Ok(())
        });
        kube
    }

    // ===== Lifecycle stories =====

    /// Story: a freshly created workload gets its finalizer, a Deployment at
    /// one replica and both routes, then waits for the pod.
    #[tokio::test]
    async fn story_new_workload_is_provisioned() {
        let mut aw = workload(None, None);
        aw.metadata.finalizers = None;
        let log = CallLog::default();
        let ctx = context(logging_kube(&log, None), logging_relay(&log, vec![], None));

        let action = reconcile(Arc::new(aw), ctx).await.unwrap();

        assert_eq!(
            log.calls(),
            vec![
                "add finalizer kuberde.io/routes",
                "apply replicas=1",
                "register tcp:2222 -> user-alice-ws-ssh",
                "register http:files.user-alice-ws -> user-alice-ws-files",
                "status Reconciling",
            ]
        );
        assert_eq!(action, Action::requeue(STARTING_REQUEUE));
    }

    /// Story: once the pod reports ready the workload becomes Ready and its
    /// activity clock starts.
    #[tokio::test]
    async fn story_ready_pod_marks_workload_ready() {
        let aw = workload(Some(AgentWorkloadPhase::Reconciling), None);
        let log = CallLog::default();
        let captured = Arc::new(Mutex::new(None));
        let mut kube = MockKubeClient::new();
        let observed = deployment(&aw, 1, 1);
        kube.expect_get_deployment()
            .returning(move |_, _| Ok(Some(observed.clone())));
        let c = captured.clone();
        kube.expect_patch_status().times(1).returning(move |_, _, status| {
            *c.lock().unwrap() = Some(status.clone());
            Ok(())
        });
        let ctx = context(kube, logging_relay(&log, routes(RouteState::Active), None));

        reconcile(Arc::new(aw), ctx).await.unwrap();

        let status = captured.lock().unwrap().clone().unwrap();
        assert_eq!(status.phase, AgentWorkloadPhase::Ready);
        assert_eq!(status.ready_replicas, Some(1));
        assert!(status.last_activity.is_some());
        assert!(log.calls().is_empty());
    }

    /// Story: a converged workload costs reads only. Any write would hit a
    /// mock without an expectation and fail the test.
    #[tokio::test]
    async fn story_converged_workload_makes_no_mutating_calls() {
        let now = Utc::now();
        let aw = workload(
            Some(AgentWorkloadPhase::Ready),
            Some(now - ChronoDuration::minutes(5)),
        );
        let observed = deployment(&aw, 1, 1);

        let mut kube = MockKubeClient::new();
        kube.expect_get_deployment()
            .returning(move |_, _| Ok(Some(observed.clone())));
        let mut relay = MockRelayApi::new();
        relay
            .expect_list_routes()
            .returning(|_| Ok(routes(RouteState::Active)));
        relay
            .expect_agent_stats()
            .returning(move |_| Ok(Some(quiet_stats(now - ChronoDuration::minutes(10), 0))));

        let ctx = context(kube, relay);
        for _ in 0..3 {
            let action = reconcile(Arc::new(aw.clone()), ctx.clone()).await.unwrap();
            assert_eq!(action, Action::requeue(TICK));
        }
    }

    /// Story: a converged Idle workload stays at zero replicas with parked
    /// routes and is left alone.
    #[tokio::test]
    async fn story_idle_workload_stays_asleep() {
        let aw = workload(Some(AgentWorkloadPhase::Idle), Some(Utc::now()));
        let observed = deployment(&aw, 0, 0);
        let mut kube = MockKubeClient::new();
        kube.expect_get_deployment()
            .returning(move |_, _| Ok(Some(observed.clone())));
        let mut relay = MockRelayApi::new();
        relay
            .expect_list_routes()
            .returning(|_| Ok(routes(RouteState::Parked)));

        let action = reconcile(Arc::new(aw), context(kube, relay)).await.unwrap();
        assert_eq!(action, Action::requeue(TICK));
    }

    // ===== Idle scaling =====

    /// Story: nobody touched the workspace for longer than its TTL. Routes
    /// are parked before the pod goes away, and only then is it marked Idle.
    #[tokio::test]
    async fn story_idle_ttl_parks_routes_then_scales_to_zero() {
        let now = Utc::now();
        let aw = workload(
            Some(AgentWorkloadPhase::Ready),
            Some(now - ChronoDuration::minutes(31)),
        );
        let log = CallLog::default();
        let ctx = context(
            logging_kube(&log, Some(deployment(&aw, 1, 1))),
            logging_relay(
                &log,
                routes(RouteState::Active),
                Some(quiet_stats(now - ChronoDuration::minutes(40), 0)),
            ),
        );

        let action = reconcile(Arc::new(aw), ctx).await.unwrap();

        assert_eq!(
            log.calls(),
            vec![
                "park tcp:2222",
                "park http:files.user-alice-ws",
                "apply replicas=0",
                "status Idle",
            ]
        );
        assert_eq!(action, Action::requeue(TICK));
    }

    /// Story: one minute short of the TTL nothing is scaled.
    #[tokio::test]
    async fn story_workload_within_ttl_keeps_running() {
        let now = Utc::now();
        let aw = workload(
            Some(AgentWorkloadPhase::Ready),
            Some(now - ChronoDuration::minutes(29)),
        );
        let log = CallLog::default();
        let ctx = context(
            logging_kube(&log, Some(deployment(&aw, 1, 1))),
            logging_relay(&log, routes(RouteState::Active), None),
        );

        reconcile(Arc::new(aw), ctx).await.unwrap();
        assert!(log.calls().is_empty());
    }

    /// Story: a long SSH session with no new connections still counts as
    /// activity; the stored clock moves forward instead of scaling down.
    #[tokio::test]
    async fn story_open_connections_keep_workload_awake() {
        let now = Utc::now();
        let aw = workload(
            Some(AgentWorkloadPhase::Ready),
            Some(now - ChronoDuration::hours(2)),
        );
        let log = CallLog::default();
        let ctx = context(
            logging_kube(&log, Some(deployment(&aw, 1, 1))),
            logging_relay(
                &log,
                routes(RouteState::Active),
                Some(quiet_stats(now - ChronoDuration::hours(2), 1)),
            ),
        );

        reconcile(Arc::new(aw), ctx).await.unwrap();
        assert_eq!(log.calls(), vec!["status Ready"]);
    }

    /// Story: after the webhook flips an Idle workload to Reconciling, the
    /// next pass scales it back up and reactivates the parked routes.
    #[tokio::test]
    async fn story_woken_workload_scales_back_up() {
        let mut aw = workload(Some(AgentWorkloadPhase::Idle), Some(Utc::now()));
        if let Some(status) = aw.status.as_mut() {
            status.phase = AgentWorkloadPhase::Reconciling;
        }
        let log = CallLog::default();
        let ctx = context(
            logging_kube(&log, Some(deployment(&aw, 0, 0))),
            logging_relay(&log, routes(RouteState::Parked), None),
        );

        let action = reconcile(Arc::new(aw), ctx).await.unwrap();

        let calls = log.calls();
        assert_eq!(calls[0], "apply replicas=1");
        assert!(calls.contains(&"register tcp:2222 -> user-alice-ws-ssh".to_string()));
        assert!(calls.contains(&"register http:files.user-alice-ws -> user-alice-ws-files".to_string()));
        assert_eq!(action, Action::requeue(STARTING_REQUEUE));
    }

    // ===== Deletion =====

    /// Story: deleting a workload releases its routes before the Deployment
    /// goes, and the finalizer is removed last.
    #[tokio::test]
    async fn story_deletion_releases_routes_before_the_pod() {
        let mut aw = workload(Some(AgentWorkloadPhase::Ready), Some(Utc::now()));
        aw.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let log = CallLog::default();
        let ctx = context(
            logging_kube(&log, None),
            logging_relay(&log, routes(RouteState::Active), None),
        );

        let action = reconcile(Arc::new(aw), ctx).await.unwrap();

        assert_eq!(
            log.calls(),
            vec![
                "status Terminating",
                "remove tcp:2222",
                "remove http:files.user-alice-ws",
                "delete deployment user-alice-ws",
                "remove finalizer kuberde.io/routes",
            ]
        );
        assert_eq!(action, Action::await_change());
    }

    /// Story: if the relay refuses a deregistration the Deployment and the
    /// finalizer stay, and the pass is retried.
    #[tokio::test]
    async fn story_deletion_stops_on_relay_error() {
        let mut aw = workload(Some(AgentWorkloadPhase::Terminating), None);
        aw.metadata.deletion_timestamp = Some(Time(Utc::now()));
        if let Some(status) = aw.status.as_mut() {
            status.message = Some(TERMINATING_MESSAGE.into());
        }

        let mut kube = MockKubeClient::new();
        kube.expect_delete_deployment().never();
        kube.expect_remove_finalizer().never();
        kube.expect_patch_status().returning(|_, _, _| Ok(()));
        let mut relay = MockRelayApi::new();
        relay
            .expect_list_routes()
            .returning(|_| Ok(routes(RouteState::Active)));
        relay
            .expect_deregister_tcp()
            .returning(|_, _| Err(OperatorError::relay("deregister_tcp", 503, "down")));

        let result = reconcile(Arc::new(aw), context(kube, relay)).await;
        assert!(matches!(result, Err(OperatorError::Relay { status: 503, .. })));
    }

    /// Story: a resource already released by a previous pass is a no-op.
    #[tokio::test]
    async fn story_deleted_workload_without_finalizer_is_ignored() {
        let mut aw = workload(Some(AgentWorkloadPhase::Terminating), None);
        aw.metadata.deletion_timestamp = Some(Time(Utc::now()));
        aw.metadata.finalizers = None;
        let ctx = context(MockKubeClient::new(), MockRelayApi::new());
        assert_eq!(reconcile(Arc::new(aw), ctx).await.unwrap(), Action::await_change());
    }

    // ===== Failures =====

    /// Story: a spec the schema cannot catch is marked Error and not
    /// requeued until the user edits it.
    #[tokio::test]
    async fn story_invalid_spec_awaits_change() {
        let mut aw = workload(None, None);
        aw.spec.services[0].external_port = None;
        let captured = Arc::new(Mutex::new(None));
        let c = captured.clone();
        let mut kube = MockKubeClient::new();
        kube.expect_patch_status().times(1).returning(move |_, _, status| {
            *c.lock().unwrap() = Some(status.clone());
            Ok(())
        });

        let action = reconcile(Arc::new(aw), context(kube, MockRelayApi::new()))
            .await
            .unwrap();

        let status = captured.lock().unwrap().clone().unwrap();
        assert_eq!(status.phase, AgentWorkloadPhase::Error);
        assert!(status.message.unwrap().contains("externalPort"));
        assert_eq!(action, Action::await_change());
    }

    /// Story: a relay outage is surfaced in status and returned for requeue.
    #[tokio::test]
    async fn story_relay_outage_is_surfaced() {
        let aw = workload(Some(AgentWorkloadPhase::Ready), Some(Utc::now()));
        let observed = deployment(&aw, 1, 1);
        let captured = Arc::new(Mutex::new(Vec::new()));
        let c = captured.clone();
        let mut kube = MockKubeClient::new();
        kube.expect_get_deployment()
            .returning(move |_, _| Ok(Some(observed.clone())));
        kube.expect_patch_status().returning(move |_, _, status| {
            c.lock().unwrap().push(status.phase);
            Ok(())
        });
        let mut relay = MockRelayApi::new();
        relay
            .expect_list_routes()
            .returning(|_| Err(OperatorError::relay_transport("list_routes", "connection refused")));

        let result = reconcile(Arc::new(aw), context(kube, relay)).await;
        assert!(matches!(result, Err(OperatorError::RelayTransport { .. })));
        assert_eq!(*captured.lock().unwrap(), vec![AgentWorkloadPhase::Error]);
    }

    /// Story: an outage while idle must not wake the workload on the next pass.
    #[tokio::test]
    async fn story_outage_while_idle_keeps_idle_phase() {
        let aw = workload(Some(AgentWorkloadPhase::Idle), Some(Utc::now()));
        let observed = deployment(&aw, 0, 0);
        let captured = Arc::new(Mutex::new(Vec::new()));
        let c = captured.clone();
        let mut kube = MockKubeClient::new();
        kube.expect_get_deployment()
            .returning(move |_, _| Ok(Some(observed.clone())));
        kube.expect_patch_status().returning(move |_, _, status| {
            c.lock().unwrap().push(status.phase);
            Ok(())
        });
        let mut relay = MockRelayApi::new();
        relay
            .expect_list_routes()
            .returning(|_| Err(OperatorError::relay_transport("list_routes", "connection refused")));

        assert!(reconcile(Arc::new(aw), context(kube, relay)).await.is_err());
        assert_eq!(*captured.lock().unwrap(), vec![AgentWorkloadPhase::Idle]);
    }

    #[test]
    fn error_policy_requeues_after_thirty_seconds() {
        let aw = Arc::new(workload(None, None));
        let ctx = context(MockKubeClient::new(), MockRelayApi::new());
        let action = error_policy(aw, &OperatorError::internal("boom"), ctx);
        assert_eq!(action, Action::requeue(ERROR_REQUEUE));
    }
}
