//! Agent session tracking
//!
//! Holds at most one live tunnel session per workload identity. Records stay
//! after an agent disconnects so the management API can still report when it
//! was last active and tell "offline" apart from "never seen".

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kuberde_common::AgentIdentity;
use kuberde_mux::MuxSession;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

/// One agent, connected or not
struct AgentRecord {
    session: Option<MuxSession>,
    credential_expiry: Option<DateTime<Utc>>,
    last_activity: Arc<Mutex<DateTime<Utc>>>,
    active_connections: Arc<AtomicUsize>,
}

impl AgentRecord {
    fn live_session(&self) -> Option<&MuxSession> {
        self.session.as_ref().filter(|s| !s.is_closed())
    }
}

/// Statistics reported by `GET /mgmt/agents/{id}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    /// A live tunnel session exists
    pub online: bool,
    /// Last time traffic flowed or the agent connected
    pub last_activity: DateTime<Utc>,
    /// At least one client connection is bridged right now
    pub has_active_session: bool,
    /// Bridged client connections
    pub active_connections: usize,
}

/// Counts one bridged client connection for as long as it is held
pub struct ConnectionGuard {
    last_activity: Arc<Mutex<DateTime<Utc>>>,
    active_connections: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(last_activity: Arc<Mutex<DateTime<Utc>>>, active_connections: Arc<AtomicUsize>) -> Self {
        active_connections.fetch_add(1, Ordering::SeqCst);
        *last_activity.lock() = Utc::now();
        Self {
            last_activity,
            active_connections,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
        *self.last_activity.lock() = Utc::now();
    }
}

/// Registry of agent sessions keyed by workload identity
#[derive(Default)]
pub struct SessionRegistry {
    agents: DashMap<AgentIdentity, AgentRecord>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `session` for `identity`, closing any session it supersedes
    ///
    /// Returns the superseded session, already closed.
    pub fn admit(
        &self,
        identity: &AgentIdentity,
        session: MuxSession,
        credential_expiry: Option<DateTime<Utc>>,
    ) -> Option<MuxSession> {
        let now = Utc::now();
        // One shard lock covers the lookup and the insert
        let previous = match self.agents.entry(identity.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                let previous = record.session.replace(session);
                record.credential_expiry = credential_expiry;
                *record.last_activity.lock() = now;
                info!(agent = %identity, "Agent reconnected");
                previous
            }
            Entry::Vacant(entry) => {
                entry.insert(AgentRecord {
                    session: Some(session),
                    credential_expiry,
                    last_activity: Arc::new(Mutex::new(now)),
                    active_connections: Arc::new(AtomicUsize::new(0)),
                });
                info!(agent = %identity, "Agent connected (first time)");
                None
            }
        };

        let previous = previous.filter(|s| !s.is_closed());
        if let Some(old) = &previous {
            info!(agent = %identity, session = old.id(), "Closing superseded session");
            old.close();
        }
        previous
    }

    /// Drop the session for `identity` if it is still `session_id`
    ///
    /// A superseded session's cleanup must not evict its successor.
    pub fn remove(&self, identity: &AgentIdentity, session_id: u64) -> bool {
        let Some(mut record) = self.agents.get_mut(identity) else {
            return false;
        };
        if record.session.as_ref().map(MuxSession::id) != Some(session_id) {
            debug!(agent = %identity, session = session_id, "Stale session cleanup ignored");
            return false;
        }
        record.session = None;
        record.credential_expiry = None;
        info!(agent = %identity, session = session_id, "Agent disconnected");
        true
    }

    /// Live session for `identity`
    pub fn get(&self, identity: &AgentIdentity) -> Option<MuxSession> {
        self.agents
            .get(identity)
            .and_then(|record| record.live_session().cloned())
    }

    /// Whether the relay has ever admitted `identity`
    pub fn is_known(&self, identity: &AgentIdentity) -> bool {
        self.agents.contains_key(identity)
    }

    /// Start counting a bridged connection for `identity`
    pub fn connection(&self, identity: &AgentIdentity) -> Option<ConnectionGuard> {
        self.agents.get(identity).map(|record| {
            ConnectionGuard::new(
                record.last_activity.clone(),
                record.active_connections.clone(),
            )
        })
    }

    /// Record a refreshed credential for the current session
    pub fn refresh_credential(
        &self,
        identity: &AgentIdentity,
        session_id: u64,
        expiry: DateTime<Utc>,
    ) -> bool {
        match self.agents.get_mut(identity) {
            Some(mut record) if record.session.as_ref().map(MuxSession::id) == Some(session_id) => {
                record.credential_expiry = Some(expiry);
                true
            }
            _ => false,
        }
    }

    /// Expiry of the current session's credential
    pub fn credential_expiry(&self, identity: &AgentIdentity) -> Option<DateTime<Utc>> {
        self.agents
            .get(identity)
            .and_then(|record| record.credential_expiry)
    }

    /// Statistics for `identity`, `None` if never seen
    pub fn stats(&self, identity: &AgentIdentity) -> Option<AgentStats> {
        self.agents.get(identity).map(|record| {
            let active_connections = record.active_connections.load(Ordering::SeqCst);
            AgentStats {
                online: record.live_session().is_some(),
                last_activity: *record.last_activity.lock(),
                has_active_session: active_connections > 0,
                active_connections,
            }
        })
    }

    /// Bump `last_activity` for every agent with bridged connections
    ///
    /// Returns how many agents were touched.
    pub fn touch_active(&self, now: DateTime<Utc>) -> usize {
        let mut touched = 0;
        for record in self.agents.iter() {
            if record.active_connections.load(Ordering::SeqCst) > 0 {
                *record.last_activity.lock() = now;
                touched += 1;
            }
        }
        touched
    }

    /// Agents with a live session
    pub fn online(&self) -> Vec<AgentIdentity> {
        let mut ids: Vec<_> = self
            .agents
            .iter()
            .filter(|r| r.live_session().is_some())
            .map(|r| r.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Close every live session
    pub fn close_all(&self) {
        for record in self.agents.iter() {
            if let Some(session) = record.live_session() {
                session.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use kuberde_mux::SessionConfig;

    use super::*;

    fn identity(raw: &str) -> AgentIdentity {
        AgentIdentity::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn newer_session_supersedes_older() {
        let registry = SessionRegistry::new();
        let id = identity("user-alice-ws");
        let ((first, _), _c1) = MuxSession::pair(SessionConfig::default());
        let ((second, _), _c2) = MuxSession::pair(SessionConfig::default());

        assert!(registry.admit(&id, first.clone(), None).is_none());
        let superseded = registry.admit(&id, second.clone(), None).unwrap();

        assert_eq!(superseded.id(), first.id());
        assert!(first.is_closed());
        assert_eq!(registry.get(&id).unwrap().id(), second.id());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admits_leave_one_live_session() {
        for _ in 0..50 {
            let registry = Arc::new(SessionRegistry::new());
            let id = identity("user-alice-ws");
            let barrier = Arc::new(tokio::sync::Barrier::new(4));
            let mut sessions = Vec::new();
            let mut peers = Vec::new();
            let mut tasks = Vec::new();
            for _ in 0..4 {
                let ((session, _), peer) = MuxSession::pair(SessionConfig::default());
                sessions.push(session.clone());
                peers.push(peer);
                let (registry, id, barrier) = (registry.clone(), id.clone(), barrier.clone());
                tasks.push(tokio::spawn(async move {
                    barrier.wait().await;
                    registry.admit(&id, session, None);
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }

            let live: Vec<_> = sessions.iter().filter(|s| !s.is_closed()).collect();
            assert_eq!(live.len(), 1);
            assert_eq!(registry.get(&id).unwrap().id(), live[0].id());
        }
    }

    #[tokio::test]
    async fn stale_cleanup_does_not_evict_successor() {
        let registry = SessionRegistry::new();
        let id = identity("user-alice-ws");
        let ((first, _), _c1) = MuxSession::pair(SessionConfig::default());
        let ((second, _), _c2) = MuxSession::pair(SessionConfig::default());
        registry.admit(&id, first.clone(), None);
        registry.admit(&id, second.clone(), None);

        assert!(!registry.remove(&id, first.id()));
        assert!(registry.get(&id).is_some());

        assert!(registry.remove(&id, second.id()));
        assert!(registry.get(&id).is_none());
        assert!(registry.is_known(&id));
    }

    #[tokio::test]
    async fn closed_session_is_not_returned() {
        let registry = SessionRegistry::new();
        let id = identity("user-alice-ws");
        let ((session, _), _client) = MuxSession::pair(SessionConfig::default());
        registry.admit(&id, session.clone(), None);

        session.close();
        assert!(registry.get(&id).is_none());
        assert!(!registry.stats(&id).unwrap().online);
    }

    #[tokio::test]
    async fn connection_guards_drive_stats() {
        let registry = SessionRegistry::new();
        let id = identity("user-alice-ws");
        assert!(registry.stats(&id).is_none());
        assert!(registry.connection(&id).is_none());

        let ((session, _), _client) = MuxSession::pair(SessionConfig::default());
        registry.admit(&id, session, None);

        let a = registry.connection(&id).unwrap();
        let b = registry.connection(&id).unwrap();
        let stats = registry.stats(&id).unwrap();
        assert!(stats.online);
        assert!(stats.has_active_session);
        assert_eq!(stats.active_connections, 2);

        drop(a);
        drop(b);
        let stats = registry.stats(&id).unwrap();
        assert!(!stats.has_active_session);
        assert_eq!(stats.active_connections, 0);
    }

    #[tokio::test]
    async fn touch_active_only_moves_busy_agents() {
        let registry = SessionRegistry::new();
        let busy = identity("user-alice-busy");
        let idle = identity("user-alice-idle");
        let ((s1, _), _c1) = MuxSession::pair(SessionConfig::default());
        let ((s2, _), _c2) = MuxSession::pair(SessionConfig::default());
        registry.admit(&busy, s1, None);
        registry.admit(&idle, s2, None);
        let _guard = registry.connection(&busy).unwrap();

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(registry.touch_active(later), 1);
        assert_eq!(registry.stats(&busy).unwrap().last_activity, later);
        assert!(registry.stats(&idle).unwrap().last_activity < later);
    }

    #[tokio::test]
    async fn credential_refresh_targets_current_session() {
        let registry = SessionRegistry::new();
        let id = identity("user-alice-ws");
        let ((session, _), _client) = MuxSession::pair(SessionConfig::default());
        let expiry = Utc::now() + chrono::Duration::minutes(5);
        registry.admit(&id, session.clone(), Some(expiry));

        let later = expiry + chrono::Duration::minutes(5);
        assert!(!registry.refresh_credential(&id, session.id() + 1000, later));
        assert_eq!(registry.credential_expiry(&id), Some(expiry));
        assert!(registry.refresh_credential(&id, session.id(), later));
        assert_eq!(registry.credential_expiry(&id), Some(later));
    }

    #[test]
    fn stats_serialize_in_camel_case() {
        let stats = AgentStats {
            online: true,
            last_activity: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            has_active_session: false,
            active_connections: 0,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["hasActiveSession"], false);
        assert_eq!(json["activeConnections"], 0);
        assert_eq!(json["lastActivity"], "2026-01-01T00:00:00Z");
    }
}
