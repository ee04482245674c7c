//! Management API
//!
//! Used by the operator (system identity) and by users managing their own
//! workloads. Every mutation is ownership-checked against the identity it
//! names or the identity currently holding the key.

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;
use kuberde_auth::{authorize, extract_token, Principal};
use kuberde_common::AgentIdentity;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RelayError, Result};
use crate::registry::AgentStats;
use crate::routing::{RegisterOutcome, RouteKey, RouteTarget, RouteView};
use crate::server::AppState;

/// Authenticated caller of a management endpoint
pub struct Caller(pub Principal);

impl FromRequestParts<AppState> for Caller {
    type Rejection = RelayError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let found = extract_token(
            parts.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            parts.uri.query(),
            parts.headers.get(COOKIE).and_then(|v| v.to_str().ok()),
        );
        let principal = state.auth.authenticate(found).await.inspect_err(|e| {
            warn!(path = %parts.uri.path(), error = %e, "Management request rejected");
        })?;
        Ok(Caller(principal))
    }
}

/// `POST /mgmt/services/tcp`
#[derive(Debug, Deserialize, Serialize)]
pub struct RegisterTcp {
    /// Per-service identity
    #[serde(rename = "agentID")]
    pub agent_id: AgentIdentity,
    /// Service selector
    pub service: String,
    /// External port
    pub port: u16,
}

/// `DELETE /mgmt/services/tcp`
#[derive(Debug, Deserialize, Serialize)]
pub struct DeregisterTcp {
    /// External port
    pub port: u16,
    /// Keep the route as parked
    #[serde(default)]
    pub park: bool,
}

/// `POST /mgmt/services/http`
#[derive(Debug, Deserialize, Serialize)]
pub struct RegisterHttp {
    /// Per-service identity
    #[serde(rename = "agentID")]
    pub agent_id: AgentIdentity,
    /// Service selector
    pub service: String,
    /// Hostname prefix
    #[serde(rename = "hostnamePrefix")]
    pub hostname_prefix: String,
}

/// `DELETE /mgmt/services/http`
#[derive(Debug, Deserialize, Serialize)]
pub struct DeregisterHttp {
    /// Hostname prefix
    #[serde(rename = "hostnamePrefix")]
    pub hostname_prefix: String,
    /// Keep the route as parked
    #[serde(default)]
    pub park: bool,
}

/// Body returned by successful registrations
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registered {
    /// `created`, `unchanged`, `reactivated` or `replaced`
    pub result: String,
}

impl From<RegisterOutcome> for Registered {
    fn from(outcome: RegisterOutcome) -> Self {
        let result = match outcome {
            RegisterOutcome::Created => "created",
            RegisterOutcome::Unchanged => "unchanged",
            RegisterOutcome::Reactivated => "reactivated",
            RegisterOutcome::Replaced(_) => "replaced",
        };
        Self {
            result: result.to_string(),
        }
    }
}

/// `GET /mgmt/routes` query
#[derive(Debug, Deserialize)]
pub struct RoutesQuery {
    /// Only routes served by this workload identity
    #[serde(rename = "agentID")]
    pub agent_id: Option<AgentIdentity>,
}

fn validate_service(service: &str) -> Result<()> {
    if kuberde_common::crd::is_dns_label(service) {
        Ok(())
    } else {
        Err(RelayError::bad_request(format!("invalid service name '{service}'")))
    }
}

pub(crate) async fn register_tcp(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(req): Json<RegisterTcp>,
) -> Result<Json<Registered>> {
    authorize(&caller, &req.agent_id)?;
    validate_service(&req.service)?;

    let key = RouteKey::Tcp(req.port);
    let target = RouteTarget::new(req.agent_id, req.service);
    let previous = state.dataplane.routing.resolve_tcp(req.port);
    let outcome = state.dataplane.routing.register(key.clone(), target, &caller)?;

    if let Err(e) = state.listeners.ensure(req.port).await {
        if previous.is_none() {
            // Roll back a route that never had a listener
            if let Err(rollback) = state.dataplane.routing.deregister(&key, false, &caller) {
                warn!(route = %key, error = %rollback, "Failed to roll back TCP route");
            }
        }
        return Err(e);
    }
    Ok(Json(outcome.into()))
}

pub(crate) async fn deregister_tcp(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(req): Json<DeregisterTcp>,
) -> Result<StatusCode> {
    state
        .dataplane
        .routing
        .deregister(&RouteKey::Tcp(req.port), req.park, &caller)?;
    if !req.park {
        state.listeners.stop(req.port);
    }
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn register_http(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(req): Json<RegisterHttp>,
) -> Result<Json<Registered>> {
    authorize(&caller, &req.agent_id)?;
    validate_service(&req.service)?;
    let outcome = state.dataplane.routing.register(
        RouteKey::Http(req.hostname_prefix),
        RouteTarget::new(req.agent_id, req.service),
        &caller,
    )?;
    Ok(Json(outcome.into()))
}

pub(crate) async fn deregister_http(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(req): Json<DeregisterHttp>,
) -> Result<StatusCode> {
    state
        .dataplane
        .routing
        .deregister(&RouteKey::Http(req.hostname_prefix), req.park, &caller)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn agent_stats(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<AgentStats>> {
    let identity = AgentIdentity::parse(&id).map_err(|e| RelayError::bad_request(e.to_string()))?;
    authorize(&caller, &identity)?;
    state
        .dataplane
        .registry
        .stats(&identity)
        .map(Json)
        .ok_or_else(|| RelayError::NotFound(format!("agent {identity}")))
}

pub(crate) async fn list_routes(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(query): Query<RoutesQuery>,
) -> Result<Json<Vec<RouteView>>> {
    match &query.agent_id {
        Some(identity) => authorize(&caller, identity)?,
        None if caller.is_administrative() => {}
        None => {
            return Err(RelayError::Auth(kuberde_auth::AuthError::forbidden(
                caller.username.clone(),
                "all routes",
            )))
        }
    }
    Ok(Json(state.dataplane.routing.snapshot(query.agent_id.as_ref())))
}
