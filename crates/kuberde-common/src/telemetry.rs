//! Tracing initialization shared by the KubeRDE binaries
//!
//! All binaries log JSON lines through `tracing-subscriber`, filtered by
//! `RUST_LOG` or a per-binary default.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to install the global subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for tracing initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Component name, used as the default filter target (e.g. "kuberde_relay")
    pub service_name: String,
    /// Emit human-readable lines instead of JSON (local development)
    pub pretty: bool,
}

impl TelemetryConfig {
    /// JSON logging for the named component
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            pretty: false,
        }
    }

    fn default_filter(&self) -> String {
        format!(
            "info,{}=debug,kube=info,tower=warn,hyper=warn",
            self.service_name.replace('-', "_")
        )
    }
}

/// Install the global tracing subscriber
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter()));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.pretty {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init()
    };

    result.map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_targets_the_component() {
        let config = TelemetryConfig::new("kuberde-relay");
        assert!(config.default_filter().contains("kuberde_relay=debug"));
        assert!(!config.pretty);
    }
}
