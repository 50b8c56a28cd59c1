//! Wall-clock and monotonic-time helpers.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Returns the current wall-clock time as milliseconds since the Unix epoch.
///
/// Millisecond timestamps fit comfortably in i64 until the year 292 million.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Converts an absolute wall-clock instant (millis since epoch) into a tokio
/// [`Instant`], clamping past instants to "now".
///
/// TTL jobs sleep until the returned instant; a target already in the past
/// fires immediately.
#[must_use]
pub fn instant_at(target_ms: i64) -> Instant {
    let now_ms = now_millis();
    let delta_ms = target_ms.saturating_sub(now_ms).max(0);
    // Non-negative after the max(0) clamp.
    #[allow(clippy::cast_sign_loss)]
    let delta = std::time::Duration::from_millis(delta_ms as u64);
    Instant::now() + delta
}
