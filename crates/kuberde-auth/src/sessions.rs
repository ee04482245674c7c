//! Server-side browser sessions
//!
//! A cookie is only honoured while its session record exists. Logout removes
//! the record, which revokes the cookie even though the token inside it is
//! still cryptographically valid.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::Principal;

/// One browser session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRecord {
    /// Subject the session belongs to
    pub subject: String,
    /// Username at login time
    pub username: String,
    /// When the session's token expires
    pub expires_at: DateTime<Utc>,
    /// Refresh token from the authorization-code exchange
    pub refresh_token: Option<String>,
}

/// In-memory session records keyed by the token's session key
#[derive(Default)]
pub struct SessionStore {
    records: DashMap<String, SessionRecord>,
}

impl SessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a session for a freshly verified principal
    pub fn create(&self, principal: &Principal, refresh_token: Option<String>) {
        debug!(username = %principal.username, "Recording browser session");
        self.records.insert(
            principal.session_key.clone(),
            SessionRecord {
                subject: principal.subject.clone(),
                username: principal.username.clone(),
                expires_at: principal.expires_at,
                refresh_token,
            },
        );
    }

    /// The record for `key`, if any
    pub fn get(&self, key: &str) -> Option<SessionRecord> {
        self.records.get(key).map(|r| r.clone())
    }

    /// Whether `key` names an unexpired, unrevoked session
    pub fn is_active(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.records
            .get(key)
            .is_some_and(|record| record.expires_at > now)
    }

    /// Revoke a session; returns whether it existed
    pub fn revoke(&self, key: &str) -> bool {
        let removed = self.records.remove(key).is_some();
        if removed {
            info!("Browser session revoked");
        }
        removed
    }

    /// Drop expired records, returning how many were removed
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.expires_at > now);
        before - self.records.len()
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
