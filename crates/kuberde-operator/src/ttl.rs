//! Idle scale-to-zero decisions

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::relay_client::AgentStats;

/// Relay activity newer than the stored value by less than this is not
/// written back, so steady traffic does not patch status every tick
pub const ACTIVITY_WRITE_THRESHOLD: Duration = Duration::from_secs(60);

/// Parse a status `lastActivity`; unparseable values count as absent
pub fn parse_activity(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Most recent activity from every source
///
/// Bridged connections count as activity right now. When no source has any
/// activity, `fallback` is used (typically when the workload became Ready).
pub fn effective_last_activity(
    status: Option<DateTime<Utc>>,
    stats: Option<&AgentStats>,
    now: DateTime<Utc>,
    fallback: DateTime<Utc>,
) -> DateTime<Utc> {
    let relay = stats.map(|s| s.last_activity);
    let busy = stats.filter(|s| s.active_connections > 0).map(|_| now);
    [status, relay, busy]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(fallback)
}

/// Scale down exactly when `now >= last + ttl`
pub fn should_scale_down(last: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
    match chrono::Duration::from_std(ttl) {
        Ok(ttl) => now >= last + ttl,
        Err(_) => false,
    }
}

/// Whether `effective` should be persisted over `stored`
pub fn should_record(stored: Option<DateTime<Utc>>, effective: DateTime<Utc>) -> bool {
    match stored {
        None => true,
        Some(stored) => (effective - stored)
            .to_std()
            .is_ok_and(|ahead| ahead >= ACTIVITY_WRITE_THRESHOLD),
    }
}
