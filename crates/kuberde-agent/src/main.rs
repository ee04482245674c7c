//! KubeRDE agent binary

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kuberde_agent::{token_source, AgentClient, AgentConfig, ClientSettings, Credentials, OsEnv};
use kuberde_common::telemetry::{init_telemetry, TelemetryConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// KubeRDE in-pod agent
///
/// Everything else comes from the bootstrap environment the controller sets:
/// `AGENT_ID`, `SERVER_URL`, `KUBERDE_SERVICES` and the `AUTH_*` variables.
#[derive(Parser, Debug)]
#[command(name = "kuberde-agent", version, about, long_about = None)]
struct Cli {
    /// Human-readable logs instead of JSON
    #[arg(long, env = "KUBERDE_LOG_PRETTY")]
    log_pretty: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut telemetry = TelemetryConfig::new("kuberde-agent");
    telemetry.pretty = cli.log_pretty;
    init_telemetry(telemetry).context("failed to initialize telemetry")?;

    let config = AgentConfig::from_env(&OsEnv).context("invalid agent environment")?;
    info!(
        agent = %config.agent_id,
        server = %config.server_url,
        services = ?config.services.names().collect::<Vec<_>>(),
        "Starting agent"
    );
    if matches!(config.credentials, kuberde_agent::CredentialConfig::Anonymous) {
        warn!("No credentials configured; connecting without a token");
    }

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let credentials = Arc::new(Credentials::new(token_source(&config.credentials, http)));
    let client = AgentClient::new(config, credentials.clone(), ClientSettings::default());

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

    let refresh = credentials.run_refresh(client.active_session(), shutdown.clone());
    tokio::select! {
        result = client.run(shutdown.clone()) => result.context("tunnel client failed")?,
        // A refresher that finishes cleanly leaves the client running
        Err(e) = refresh => {
            error!(error = %e, "Credential renewal exhausted");
            shutdown.cancel();
            return Err(e).context("credential renewal failed");
        }
    }
    Ok(())
}
