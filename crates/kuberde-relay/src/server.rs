//! Relay HTTP server
//!
//! One axum router on the main port serves the agent tunnel, the management
//! API and the browser login endpoints. The hostname-routed ingress and the
//! per-route TCP listeners run beside it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use kuberde_auth::oidc::OidcClient;
use kuberde_auth::Authenticator;
use kuberde_mux::SessionConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::RelayConfig;
use crate::dataplane::Dataplane;
use crate::error::{RelayError, Result};
use crate::http_ingress::HttpIngress;
use crate::listeners::TcpListeners;
use crate::registry::SessionRegistry;
use crate::routing::RoutingTable;
use crate::scale_up::{ScaleUpNotifier, ScaleUpTrigger};
use crate::{auth_routes, mgmt, monitor, tunnel};

/// Cookie settings for browser sessions
#[derive(Clone, Debug)]
pub struct CookieSettings {
    /// Add `Secure`
    pub secure: bool,
}

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Routing, sessions and scale-up
    pub dataplane: Dataplane,
    /// Token verification and browser sessions
    pub auth: Authenticator,
    /// Per-route TCP listeners
    pub listeners: Arc<TcpListeners>,
    /// Tuning for admitted tunnel sessions
    pub session_config: SessionConfig,
    /// Browser login client; login endpoints answer 503 without it
    pub oidc: Option<Arc<OidcClient>>,
    /// Externally visible base URL
    pub public_url: String,
    /// Cookie attributes
    pub cookies: CookieSettings,
    /// Set once every listener is bound
    pub ready: Arc<AtomicBool>,
}

/// Everything needed to assemble [`AppState`]
pub struct StateParts {
    /// Token verification
    pub auth: Authenticator,
    /// Scale-up webhook client
    pub notifier: Option<Arc<dyn ScaleUpNotifier>>,
    /// Browser login client
    pub oidc: Option<Arc<OidcClient>>,
}

impl AppState {
    /// Build the relay's shared state from its configuration
    pub fn new(config: &RelayConfig, parts: StateParts, shutdown: CancellationToken) -> Self {
        let dataplane = Dataplane::new(
            Arc::new(RoutingTable::new(
                config.reserved_ports(),
                config.normalized_agent_domain(),
            )),
            Arc::new(SessionRegistry::new()),
            Arc::new(ScaleUpTrigger::new(parts.notifier)),
        );
        let listeners = Arc::new(TcpListeners::new(
            dataplane.clone(),
            config.tcp_bind_host,
            shutdown,
        ));
        Self {
            dataplane,
            auth: parts.auth,
            listeners,
            session_config: config.session_config(),
            oidc: parts.oidc,
            public_url: config.public_url.trim_end_matches('/').to_string(),
            cookies: CookieSettings {
                secure: config.secure_cookies(),
            },
            ready: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// The main-port router
pub fn router(state: AppState) -> Router {
    Router::new()
        // Agent tunnel
        .route(kuberde_common::TUNNEL_PATH, get(tunnel::tunnel_handler))
        // Management API
        .route(
            "/mgmt/services/tcp",
            post(mgmt::register_tcp).delete(mgmt::deregister_tcp),
        )
        .route(
            "/mgmt/services/http",
            post(mgmt::register_http).delete(mgmt::deregister_http),
        )
        .route("/mgmt/agents/{id}", get(mgmt::agent_stats))
        .route("/mgmt/routes", get(mgmt::list_routes))
        // Browser login
        .route("/auth/login", get(auth_routes::login))
        .route("/auth/callback", get(auth_routes::callback))
        .route("/auth/logout", post(auth_routes::logout))
        .route("/auth/refresh", post(auth_routes::refresh))
        // Probes
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn readyz(axum::extract::State(state): axum::extract::State<AppState>) -> impl IntoResponse {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

/// Bind every listener and serve until `shutdown`
pub async fn run(config: RelayConfig, parts: StateParts, shutdown: CancellationToken) -> Result<()> {
    let state = AppState::new(&config, parts, shutdown.clone());

    let main = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|e| RelayError::internal(format!("bind {}: {e}", config.listen_addr)))?;
    let ingress = TcpListener::bind(config.ingress_addr)
        .await
        .map_err(|e| RelayError::internal(format!("bind {}: {e}", config.ingress_addr)))?;

    tokio::spawn(
        HttpIngress::new(state.dataplane.clone(), state.auth.clone()).serve(ingress, shutdown.clone()),
    );
    tokio::spawn(monitor::run(
        state.dataplane.clone(),
        state.auth.sessions().clone(),
        shutdown.clone(),
    ));

    state.ready.store(true, Ordering::SeqCst);
    info!(addr = %config.listen_addr, ingress = %config.ingress_addr, "Relay listening");

    let registry = state.dataplane.registry.clone();
    let graceful = shutdown.clone();
    axum::serve(main, router(state))
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await
        .map_err(|e| RelayError::internal(format!("server error: {e}")))?;

    registry.close_all();
    shutdown.cancel();
    info!("Relay stopped");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use clap::Parser;
    use tower::ServiceExt;

    use super::*;
    use crate::testing::authenticator;

    pub fn test_state() -> AppState {
        let config = RelayConfig::parse_from([
            "kuberde-relay",
            "--agent-domain",
            "rde.example.com",
            "--tcp-bind-host",
            "127.0.0.1",
        ]);
        AppState::new(
            &config,
            StateParts {
                auth: authenticator(),
                notifier: None,
                oidc: None,
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn probes() {
        let state = test_state();
        let app = router(state.clone());

        let health = app
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let not_ready = app
            .clone()
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(not_ready.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.ready.store(true, Ordering::SeqCst);
        let ready = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ready.status(), StatusCode::OK);
    }
}
