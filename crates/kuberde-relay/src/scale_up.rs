//! Scale-up signal for idle workloads
//!
//! When a client hits a parked route the relay asks the operator to bring
//! the workload back. Triggers are deduplicated per identity for a short
//! window so a burst of connection attempts produces one webhook call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kuberde_auth::TokenSource;
use kuberde_common::AgentIdentity;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};

/// Duplicate triggers for one identity are suppressed for this long
pub const IN_PROGRESS_WINDOW: Duration = Duration::from_secs(30);

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Operator's answer to a scale-up request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleUpStatus {
    /// The workload was idle and is being scaled up
    Scaling,
    /// The workload was not idle
    Running,
}

/// Request body for the operator's webhook
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleUpRequest {
    /// Workload or per-service identity
    pub agent_id: AgentIdentity,
}

/// Response body for the operator's webhook
#[derive(Debug, Serialize, Deserialize)]
pub struct ScaleUpResponse {
    /// Outcome
    pub status: ScaleUpStatus,
}

/// Something that can ask for an idle workload to be woken
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScaleUpNotifier: Send + Sync {
    /// Ask for `identity`'s workload to be scaled up
    async fn request_scale_up(&self, identity: &AgentIdentity) -> Result<ScaleUpStatus>;
}

/// Calls the operator's `/scale-up` webhook
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    tokens: Arc<dyn TokenSource>,
}

impl WebhookNotifier {
    /// Notifier posting to `url` with bearer tokens from `tokens`
    pub fn new(client: reqwest::Client, url: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            client,
            url: url.into(),
            tokens,
        }
    }
}

#[async_trait]
impl ScaleUpNotifier for WebhookNotifier {
    async fn request_scale_up(&self, identity: &AgentIdentity) -> Result<ScaleUpStatus> {
        let token = self.tokens.fetch().await?;
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&token.access_token)
            .header("Idempotency-Key", identity.as_str())
            .timeout(WEBHOOK_TIMEOUT)
            .json(&ScaleUpRequest {
                agent_id: identity.clone(),
            })
            .send()
            .await
            .map_err(|e| RelayError::internal(format!("scale-up webhook failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(RelayError::NotFound(identity.to_string())),
            status if status.is_success() => {
                let body: ScaleUpResponse = response.json().await.map_err(|e| {
                    RelayError::internal(format!("invalid scale-up response: {e}"))
                })?;
                Ok(body.status)
            }
            status => Err(RelayError::internal(format!(
                "scale-up webhook returned HTTP {status}"
            ))),
        }
    }
}

/// Fires scale-up requests with a per-identity in-progress guard
pub struct ScaleUpTrigger {
    notifier: Option<Arc<dyn ScaleUpNotifier>>,
    in_flight: Arc<DashMap<AgentIdentity, Instant>>,
    window: Duration,
}

impl ScaleUpTrigger {
    /// Trigger backed by `notifier`; `None` disables scale-up
    pub fn new(notifier: Option<Arc<dyn ScaleUpNotifier>>) -> Self {
        Self {
            notifier,
            in_flight: Arc::new(DashMap::new()),
            window: IN_PROGRESS_WINDOW,
        }
    }

    #[cfg(test)]
    fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Request a scale-up for `identity` unless one is already in progress
    ///
    /// The call runs in the background; the returned handle is for tests
    /// and callers that want to wait.
    pub fn fire(&self, identity: &AgentIdentity) -> Option<JoinHandle<()>> {
        let notifier = self.notifier.clone()?;
        match self.in_flight.entry(identity.clone()) {
            Entry::Occupied(entry) if entry.get().elapsed() < self.window => {
                debug!(agent = %identity, "Scale-up already in progress");
                return None;
            }
            Entry::Occupied(mut entry) => {
                entry.insert(Instant::now());
            }
            Entry::Vacant(entry) => {
                entry.insert(Instant::now());
            }
        }

        let identity = identity.clone();
        let in_flight = self.in_flight.clone();
        Some(tokio::spawn(async move {
            match notifier.request_scale_up(&identity).await {
                Ok(status) => info!(agent = %identity, ?status, "Scale-up requested"),
                Err(e) => {
                    warn!(agent = %identity, error = %e, "Scale-up request failed");
                    // Let the next connection attempt retry straight away
                    in_flight.remove(&identity);
                }
            }
        }))
    }

    /// Forget guards older than the window
    pub fn prune(&self) -> usize {
        let before = self.in_flight.len();
        let window = self.window;
        self.in_flight.retain(|_, fired| fired.elapsed() < window);
        before - self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn identity() -> AgentIdentity {
        AgentIdentity::parse("user-alice-ws").unwrap()
    }

    fn counting_notifier(calls: Arc<AtomicUsize>) -> MockScaleUpNotifier {
        let mut notifier = MockScaleUpNotifier::new();
        notifier.expect_request_scale_up().returning(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(ScaleUpStatus::Scaling)
        });
        notifier
    }

    #[tokio::test]
    async fn duplicate_triggers_are_suppressed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let trigger = ScaleUpTrigger::new(Some(Arc::new(counting_notifier(calls.clone()))));

        trigger.fire(&identity()).unwrap().await.unwrap();
        assert!(trigger.fire(&identity()).is_none());
        assert!(trigger.fire(&identity()).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn guard_expires_after_window() {
        let calls = Arc::new(AtomicUsize::new(0));
        let trigger = ScaleUpTrigger::new(Some(Arc::new(counting_notifier(calls.clone()))))
            .with_window(Duration::from_millis(20));

        trigger.fire(&identity()).unwrap().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(trigger.prune(), 1);
        trigger.fire(&identity()).unwrap().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_request_clears_guard() {
        let mut notifier = MockScaleUpNotifier::new();
        notifier
            .expect_request_scale_up()
            .times(2)
            .returning(|_| Err(RelayError::internal("operator down")));
        let trigger = ScaleUpTrigger::new(Some(Arc::new(notifier)));

        trigger.fire(&identity()).unwrap().await.unwrap();
        trigger.fire(&identity()).unwrap().await.unwrap();
    }

    #[test]
    fn disabled_trigger_never_fires() {
        assert!(ScaleUpTrigger::new(None).fire(&identity()).is_none());
    }

    #[test]
    fn webhook_body_uses_camel_case() {
        let body = serde_json::to_value(ScaleUpRequest {
            agent_id: identity(),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"agentId": "user-alice-ws"}));

        let parsed: ScaleUpResponse = serde_json::from_str(r#"{"status":"running"}"#).unwrap();
        assert_eq!(parsed.status, ScaleUpStatus::Running);
    }
}
