//! Human-friendly duration parsing for CRD fields such as `ttl`

use std::time::Duration;

use crate::{Error, Result};

/// Parse a duration string into a [`Duration`].
///
/// Supports `Nd`, `Nh`, `Nm`, `Ns` and raw seconds.
/// Examples: "30m" → 1800s, "2h" → 7200s, "90" → 90s, "0" → zero.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (digits, unit_secs) = if let Some(days) = s.strip_suffix('d') {
        (days, 86_400)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600)
    } else if let Some(minutes) = s.strip_suffix('m') {
        (minutes, 60)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else {
        (s, 1)
    };

    let n: u64 = digits.parse().map_err(|_| {
        Error::validation(format!(
            "invalid duration '{}', expected e.g. 2h, 30m, 90s",
            s
        ))
    })?;

    n.checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| Error::validation(format!("duration '{}' is too large", s)))
}
