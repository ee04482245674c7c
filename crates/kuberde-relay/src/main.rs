//! KubeRDE relay binary

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kuberde_auth::jwks::JwksCache;
use kuberde_auth::oidc::{discover, OidcClient, OidcClientConfig};
use kuberde_auth::{
    Authenticator, ClientCredentials, ClientCredentialsSource, JwtVerifier, SessionStore,
    StaticTokenSource, TokenSource, TokenVerifier, VerifierConfig,
};
use kuberde_common::telemetry::{init_telemetry, TelemetryConfig};
use kuberde_relay::scale_up::{ScaleUpNotifier, WebhookNotifier};
use kuberde_relay::{RelayConfig, StateParts};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::parse();

    let mut telemetry = TelemetryConfig::new("kuberde-relay");
    telemetry.pretty = config.log_pretty;
    init_telemetry(telemetry).context("failed to initialize telemetry")?;

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let (verifier, oidc) = build_auth(&config, &http).await?;
    let auth = Authenticator::new(verifier, Arc::new(SessionStore::new()));
    let notifier = build_notifier(&config, &http);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            return;
        }
        info!("Shutdown requested");
        signal.cancel();
    });

    kuberde_relay::run(
        config,
        StateParts {
            auth,
            notifier,
            oidc,
        },
        shutdown,
    )
    .await?;
    Ok(())
}

/// Token verifier and, with an issuer, the browser login client
async fn build_auth(
    config: &RelayConfig,
    http: &reqwest::Client,
) -> anyhow::Result<(Arc<dyn TokenVerifier>, Option<Arc<OidcClient>>)> {
    if let Some(secret) = &config.jwt_secret {
        warn!("Using a static HS256 secret; browser login is disabled");
        let verifier = JwtVerifier::hmac(
            secret.as_bytes(),
            VerifierConfig {
                issuer: None,
                audiences: config.oidc_audiences.clone(),
            },
        );
        return Ok((Arc::new(verifier), None));
    }

    let issuer = config
        .oidc_issuer
        .as_deref()
        .context("either --oidc-issuer or --jwt-secret is required")?;
    let metadata = discover(http, issuer)
        .await
        .context("OIDC discovery failed")?;

    let jwks = Arc::new(JwksCache::new(http.clone(), metadata.jwks_uri.clone()));
    let verifier = JwtVerifier::jwks(
        jwks,
        VerifierConfig {
            issuer: Some(metadata.issuer.clone()),
            audiences: config.oidc_audiences.clone(),
        },
    );
    let oidc = OidcClient::new(
        http.clone(),
        metadata,
        OidcClientConfig {
            client_id: config.oidc_client_id.clone(),
            client_secret: config.oidc_client_secret.clone(),
            redirect_uri: format!("{}/auth/callback", config.public_url.trim_end_matches('/')),
        },
    );
    Ok((Arc::new(verifier), Some(Arc::new(oidc))))
}

/// Scale-up webhook client, when a URL and a system identity are configured
fn build_notifier(
    config: &RelayConfig,
    http: &reqwest::Client,
) -> Option<Arc<dyn ScaleUpNotifier>> {
    let url = config.scale_up_url.clone()?;
    let tokens: Arc<dyn TokenSource> = match (
        &config.system_client_id,
        &config.system_client_secret,
        &config.system_token_url,
    ) {
        (Some(client_id), Some(client_secret), Some(token_url)) => {
            Arc::new(ClientCredentialsSource::new(
                http.clone(),
                ClientCredentials {
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                    token_url: token_url.clone(),
                },
            ))
        }
        _ => match &config.system_token {
            Some(token) => Arc::new(StaticTokenSource::new(token.clone())),
            None => {
                warn!("Scale-up URL set without a system identity; scale-up disabled");
                return None;
            }
        },
    };
    info!(%url, "Scale-up webhook enabled");
    Some(Arc::new(WebhookNotifier::new(http.clone(), url, tokens)))
}
