//! Scale-up webhook
//!
//! The relay calls `POST /scale-up` when traffic reaches a parked route. An
//! Idle workload is flipped to Reconciling with fresh activity; the next
//! reconcile scales it back to one replica and reactivates its routes.
//! Repeated calls while the workload wakes answer `running`.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use kuberde_auth::{extract_token, AuthError, Authenticator};
use kuberde_common::crd::{AgentWorkloadPhase, AgentWorkloadStatus};
use kuberde_common::AgentIdentity;

use crate::error::{OperatorError, Result};
use crate::kube_client::KubeClient;

const WAKE_MESSAGE: &str = "Scale-up requested";

/// Webhook request body
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleUpRequest {
    /// Workload or per-service identity
    pub agent_id: AgentIdentity,
}

/// What the webhook did
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleUpStatus {
    /// The workload was Idle and is waking
    Scaling,
    /// The workload was not Idle
    Running,
}

/// Webhook response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ScaleUpResponse {
    /// Outcome
    pub status: ScaleUpStatus,
}

/// Shared webhook state
#[derive(Clone)]
pub struct WebhookState {
    /// Verifies caller tokens
    pub auth: Authenticator,
    /// Reads and patches AgentWorkloads
    pub kube: Arc<dyn KubeClient>,
}

/// Webhook routes
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/scale-up", post(scale_up))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

async fn scale_up(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: std::result::Result<Json<ScaleUpRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ScaleUpResponse>)> {
    let found = extract_token(
        headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
        None,
        None,
    );
    let caller = state.auth.authenticate(found).await.inspect_err(|e| {
        warn!(error = %e, "Scale-up request rejected");
    })?;
    if !caller.is_administrative() {
        return Err(AuthError::forbidden(&caller.username, "scale-up").into());
    }

    let Json(request) = body.map_err(|e| OperatorError::BadRequest(e.body_text()))?;
    let identity = request.agent_id;

    let aw = state
        .kube
        .find_workload(&identity)
        .await?
        .ok_or_else(|| OperatorError::UnknownIdentity(identity.to_string()))?;

    if aw.phase() != AgentWorkloadPhase::Idle {
        return Ok((
            StatusCode::OK,
            Json(ScaleUpResponse {
                status: ScaleUpStatus::Running,
            }),
        ));
    }

    let namespace = aw
        .namespace()
        .ok_or_else(|| OperatorError::internal("AgentWorkload has no namespace"))?;
    let status = AgentWorkloadStatus {
        phase: AgentWorkloadPhase::Reconciling,
        message: Some(WAKE_MESSAGE.to_string()),
        last_activity: Some(Utc::now().to_rfc3339()),
        ..aw.status.clone().unwrap_or_default()
    };
    state
        .kube
        .patch_status(&namespace, &aw.name_any(), &status)
        .await?;
    info!(%identity, workload = %aw.name_any(), caller = %caller.username, "Waking idle workload");

    Ok((
        StatusCode::ACCEPTED,
        Json(ScaleUpResponse {
            status: ScaleUpStatus::Scaling,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::body::Body;
    use axum::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use kuberde_auth::{JwtVerifier, SessionStore, VerifierConfig, ADMIN_ROLE, SYSTEM_ROLE};
    use kuberde_common::crd::{
        AgentWorkload, AgentWorkloadSpec, ServiceProtocol, ServiceSpec, WorkloadContainer,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::kube_client::{select_workload, MockKubeClient};

    const SECRET: &[u8] = b"operator-test-secret";

    fn token(username: &str, roles: &[&str]) -> String {
        let now = Utc::now().timestamp();
        let claims = json!({
            "sub": format!("sub-{username}"),
            "preferred_username": username,
            "realm_access": { "roles": roles },
            "iat": now,
            "exp": now + 300,
        });
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn workload(phase: AgentWorkloadPhase) -> AgentWorkload {
        named_workload("ws", phase)
    }

    fn named_workload(name: &str, phase: AgentWorkloadPhase) -> AgentWorkload {
        let mut aw = AgentWorkload::new(
            name,
            AgentWorkloadSpec {
                owner: "alice".into(),
                server_url: "ws://relay/ws".into(),
                services: vec![],
                workload_container: WorkloadContainer {
                    image: "ubuntu".into(),
                    ..Default::default()
                },
                ttl: Some("30m".into()),
                auth_secret: None,
                agent_image: None,
            },
        );
        aw.metadata.namespace = Some("dev".into());
        aw.status = Some(AgentWorkloadStatus {
            phase,
            ..Default::default()
        });
        aw
    }

    fn app(aw: AgentWorkload, patched: Arc<Mutex<Vec<AgentWorkloadStatus>>>) -> Router {
        app_with(vec![aw], Arc::new(Mutex::new(Vec::new())), patched)
    }

    fn app_with(
        workloads: Vec<AgentWorkload>,
        woken: Arc<Mutex<Vec<String>>>,
        patched: Arc<Mutex<Vec<AgentWorkloadStatus>>>,
    ) -> Router {
        let mut kube = MockKubeClient::new();
        kube.expect_find_workload()
            .returning(move |id| Ok(select_workload(workloads.clone(), id)));
        kube.expect_patch_status().returning(move |_, name, status| {
            woken.lock().unwrap().push(name.to_string());
            patched.lock().unwrap().push(status.clone());
            Ok(())
        });
        router(WebhookState {
            auth: Authenticator::new(
                Arc::new(JwtVerifier::hmac(SECRET, VerifierConfig::default())),
                Arc::new(SessionStore::new()),
            ),
            kube: Arc::new(kube),
        })
    }

    async fn call(app: &Router, bearer: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut request = Request::post("/scale-up")
            .header("content-type", "application/json")
            .header("Idempotency-Key", "user-alice-ws");
        if let Some(token) = bearer {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        let response = app
            .clone()
            .oneshot(request.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    /// Story: traffic hits a parked route, the relay asks to wake the
    /// workload, and a retry while it starts is answered idempotently.
    #[tokio::test]
    async fn story_relay_wakes_idle_workload() {
        let patched = Arc::new(Mutex::new(Vec::new()));
        let app = app(workload(AgentWorkloadPhase::Idle), patched.clone());
        let system = token("kuberde-relay", &[SYSTEM_ROLE]);

        let (status, body) = call(&app, Some(&system), json!({"agentId": "user-alice-ws"})).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, json!({"status": "scaling"}));

        let patched = patched.lock().unwrap();
        assert_eq!(patched.len(), 1);
        assert_eq!(patched[0].phase, AgentWorkloadPhase::Reconciling);
        assert!(patched[0].last_activity.is_some());
    }

    #[tokio::test]
    async fn running_workload_is_left_alone() {
        let patched = Arc::new(Mutex::new(Vec::new()));
        let app = app(workload(AgentWorkloadPhase::Ready), patched.clone());
        let admin = token("root", &[ADMIN_ROLE]);

        let (status, body) = call(&app, Some(&admin), json!({"agentId": "user-alice-ws"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "running"}));
        assert!(patched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn overlapping_names_wake_the_named_workload() {
        // Running `ws` serves `x`; idle `ws-x` shares the identity string
        let mut ws = named_workload("ws", AgentWorkloadPhase::Ready);
        ws.spec.services.push(ServiceSpec {
            name: "x".into(),
            port: 8080,
            protocol: ServiceProtocol::Http,
            external_port: None,
        });
        let ws_x = named_workload("ws-x", AgentWorkloadPhase::Idle);
        let woken = Arc::new(Mutex::new(Vec::new()));
        let app = app_with(vec![ws, ws_x], woken.clone(), Arc::default());
        let system = token("kuberde-relay", &[SYSTEM_ROLE]);

        let (status, body) = call(&app, Some(&system), json!({"agentId": "user-alice-ws-x"})).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, json!({"status": "scaling"}));
        assert_eq!(*woken.lock().unwrap(), vec!["ws-x".to_string()]);
    }

    #[tokio::test]
    async fn unknown_identity_is_not_found() {
        let app = app(workload(AgentWorkloadPhase::Idle), Arc::default());
        let system = token("kuberde-relay", &[SYSTEM_ROLE]);
        let (status, body) = call(&app, Some(&system), json!({"agentId": "user-bob-ws"})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);
    }

    #[tokio::test]
    async fn callers_need_system_or_admin_tokens() {
        let app = app(workload(AgentWorkloadPhase::Idle), Arc::default());

        let (status, _) = call(&app, None, json!({"agentId": "user-alice-ws"})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let alice = token("alice", &[]);
        let (status, _) = call(&app, Some(&alice), json!({"agentId": "user-alice-ws"})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let app = app(workload(AgentWorkloadPhase::Idle), Arc::default());
        let system = token("kuberde-relay", &[SYSTEM_ROLE]);
        let (status, _) = call(&app, Some(&system), json!({"agentId": "Not Valid"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
