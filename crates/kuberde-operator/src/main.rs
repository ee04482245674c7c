//! KubeRDE operator binary

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kuberde_auth::jwks::JwksCache;
use kuberde_auth::oidc::discover;
use kuberde_auth::{
    Authenticator, ClientCredentials, ClientCredentialsSource, JwtVerifier, SessionStore,
    StaticTokenSource, TokenSource, TokenVerifier, VerifierConfig,
};
use kuberde_common::crd::AgentWorkload;
use kuberde_common::telemetry::{init_telemetry, TelemetryConfig};
use kuberde_operator::kube_client::{KubeClientImpl, FIELD_MANAGER};
use kuberde_operator::relay_client::HttpRelayClient;
use kuberde_operator::webhook::{self, WebhookState};
use kuberde_operator::{error_policy, reconcile, Context, ControllerSettings, OperatorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();

    if config.crd {
        let crd = serde_yaml::to_string(&AgentWorkload::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let mut telemetry = TelemetryConfig::new("kuberde-operator");
    telemetry.pretty = config.log_pretty;
    init_telemetry(telemetry).context("failed to initialize telemetry")?;

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    ensure_crd_installed(&client).await?;

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let tokens = system_tokens(&config, &http)?;
    let verifier = build_verifier(&config, &http).await?;

    let kube = Arc::new(KubeClientImpl::new(client.clone()));
    let relay = Arc::new(HttpRelayClient::new(http, config.relay_url.clone(), tokens));
    let ctx = Arc::new(Context::new(
        kube.clone(),
        relay,
        ControllerSettings {
            agent_image: config.agent_image.clone(),
            tick: config.tick(),
        },
    ));

    let shutdown = CancellationToken::new();
    let webhook = tokio::spawn(serve_webhook(
        config.webhook_addr,
        WebhookState {
            auth: Authenticator::new(verifier, Arc::new(SessionStore::new())),
            kube,
        },
        shutdown.clone(),
    ));

    let (workloads, deployments): (Api<AgentWorkload>, Api<Deployment>) =
        match &config.watch_namespace {
            Some(ns) => (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
            ),
            None => (Api::all(client.clone()), Api::all(client.clone())),
        };

    info!(relay = %config.relay_url, "Starting AgentWorkload controller");
    Controller::new(workloads, WatcherConfig::default())
        .owns(deployments, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "AgentWorkload reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "AgentWorkload reconciliation error");
                }
            }
        })
        .await;

    info!("Controller stopped");
    shutdown.cancel();
    webhook.await.context("webhook task panicked")??;
    Ok(())
}

/// Install or update the AgentWorkload CRD
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    info!("Installing AgentWorkload CRD...");
    crds.patch(
        "agentworkloads.kuberde.io",
        &params,
        &Patch::Apply(&AgentWorkload::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install AgentWorkload CRD: {}", e))?;
    Ok(())
}

/// Tokens for the operator's calls to the relay
fn system_tokens(config: &OperatorConfig, http: &reqwest::Client) -> anyhow::Result<Arc<dyn TokenSource>> {
    match (
        &config.system_client_id,
        &config.system_client_secret,
        &config.system_token_url,
    ) {
        (Some(client_id), Some(client_secret), Some(token_url)) => {
            Ok(Arc::new(ClientCredentialsSource::new(
                http.clone(),
                ClientCredentials {
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                    token_url: token_url.clone(),
                },
            )))
        }
        _ => {
            let token = config
                .system_token
                .clone()
                .context("a system identity is required: set client credentials or --system-token")?;
            warn!("Using a static system token for the relay");
            Ok(Arc::new(StaticTokenSource::new(token)))
        }
    }
}

/// Verifier for webhook callers
async fn build_verifier(
    config: &OperatorConfig,
    http: &reqwest::Client,
) -> anyhow::Result<Arc<dyn TokenVerifier>> {
    if let Some(secret) = &config.jwt_secret {
        warn!("Verifying webhook callers with a static HS256 secret");
        return Ok(Arc::new(JwtVerifier::hmac(
            secret.as_bytes(),
            VerifierConfig {
                issuer: None,
                audiences: config.oidc_audiences.clone(),
            },
        )));
    }

    let issuer = config
        .oidc_issuer
        .as_deref()
        .context("either --oidc-issuer or --jwt-secret is required")?;
    let metadata = discover(http, issuer)
        .await
        .context("OIDC discovery failed")?;
    let jwks = Arc::new(JwksCache::new(http.clone(), metadata.jwks_uri.clone()));
    Ok(Arc::new(JwtVerifier::jwks(
        jwks,
        VerifierConfig {
            issuer: Some(metadata.issuer),
            audiences: config.oidc_audiences.clone(),
        },
    )))
}

async fn serve_webhook(
    addr: std::net::SocketAddr,
    state: WebhookState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind webhook on {addr}"))?;
    info!(%addr, "Scale-up webhook listening");
    axum::serve(listener, webhook::router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("webhook server failed")
}
