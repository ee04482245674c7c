//! Periodic housekeeping
//!
//! Agents with bridged connections count as active even when no new
//! connection arrives, so the controller's idle-TTL check sees long-lived
//! SSH sessions as activity.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kuberde_auth::SessionStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dataplane::Dataplane;

/// How often housekeeping runs
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(60);

/// What one housekeeping pass did
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Agents whose activity was bumped
    pub touched: usize,
    /// Browser sessions dropped
    pub purged_sessions: usize,
    /// Scale-up guards forgotten
    pub pruned_scale_ups: usize,
}

/// One housekeeping pass
pub fn tick(dataplane: &Dataplane, sessions: &SessionStore) -> TickReport {
    let now = Utc::now();
    TickReport {
        touched: dataplane.registry.touch_active(now),
        purged_sessions: sessions.purge_expired(now),
        pruned_scale_ups: dataplane.scale_up.prune(),
    }
}

/// Run housekeeping until `shutdown`
pub async fn run(dataplane: Dataplane, sessions: Arc<SessionStore>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(MONITOR_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Monitor stopped");
                return;
            }
            _ = interval.tick() => {
                let report = tick(&dataplane, &sessions);
                debug!(?report, "Housekeeping pass");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use kuberde_common::AgentIdentity;

    use super::*;
    use crate::dataplane::tests::{connect_agent, dataplane};
    use crate::testing::principal;

    #[tokio::test]
    async fn bridged_connections_count_as_activity() {
        let dp = dataplane(None);
        let (_agent, _incoming) = connect_agent(&dp, "user-alice-ws");
        let identity = AgentIdentity::parse("user-alice-ws").unwrap();

        let sessions = SessionStore::new();
        assert_eq!(tick(&dp, &sessions).touched, 0);

        let _guard = dp.registry.connection(&identity).unwrap();
        assert_eq!(tick(&dp, &sessions).touched, 1);
    }

    #[tokio::test]
    async fn expired_browser_sessions_are_purged() {
        let dp = dataplane(None);
        let sessions = SessionStore::new();
        let mut expired = principal("alice", &[]);
        expired.expires_at = Utc::now() - chrono::Duration::minutes(1);
        sessions.create(&expired, None);
        sessions.create(&principal("bob", &[]), None);

        let report = tick(&dp, &sessions);
        assert_eq!(report.purged_sessions, 1);
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(
            dataplane(None),
            Arc::new(SessionStore::new()),
            shutdown.clone(),
        ));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
