//! Eviction ordering: count-driven LRU/LFU/FIFO, idle sweep, and
//! memory-pressure victim selection.
//!
//! The logic here is pure; the managers snapshot their records into
//! [`EvictionCandidate`]s, pick victims, and emit the `evict` cascade. The
//! count check runs debounced after every set; the idle sweep runs on a
//! fixed interval while enabled.

use std::time::Duration;

use cachegrid_core::RemoveReason;

use crate::config::EvictionMode;

/// Delay of the post-set eviction check.
pub const EVICTION_DEBOUNCE: Duration = Duration::from_millis(100);
/// Interval of the idle sweep while enabled.
pub const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
/// Remove-event batch size used by `clear`.
pub const CLEAR_BATCH_SIZE: usize = 1_000;

/// Snapshot of one record's eviction-relevant stats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub scope: String,
    pub key: String,
    pub created: i64,
    /// `last_access || created`.
    pub last_activity: i64,
    /// `touch + read` (LFU ordering).
    pub frequency: u64,
    /// `touch + read + hit` (memory-pressure ordering).
    pub pressure_score: u64,
    pub size: u64,
}

/// The remove reason corresponding to an eviction mode.
#[must_use]
pub fn mode_reason(mode: EvictionMode) -> RemoveReason {
    match mode {
        EvictionMode::Lru => RemoveReason::Lru,
        EvictionMode::Lfu => RemoveReason::Lfu,
        EvictionMode::Fifo => RemoveReason::Fifo,
    }
}

/// Orders candidates most-evictable first under the given mode.
#[must_use]
pub fn order_for_eviction(
    mode: EvictionMode,
    mut candidates: Vec<EvictionCandidate>,
) -> Vec<EvictionCandidate> {
    match mode {
        EvictionMode::Fifo => candidates.sort_by_key(|c| c.created),
        EvictionMode::Lru => candidates.sort_by_key(|c| c.last_activity),
        EvictionMode::Lfu => {
            candidates.sort_by_key(|c| (c.frequency, c.last_activity));
        }
    }
    candidates
}

/// How many records must go to get back under `max_records`.
///
/// `None` (unlimited) never evicts.
#[must_use]
pub fn overflow_count(len: u64, max_records: Option<u64>) -> u64 {
    match max_records {
        Some(max) => len.saturating_sub(max),
        None => 0,
    }
}

/// Candidates whose idle time exceeds `max_idle_ms` at `now`.
#[must_use]
pub fn idle_victims(
    candidates: Vec<EvictionCandidate>,
    now: i64,
    max_idle_ms: u64,
) -> Vec<EvictionCandidate> {
    // Idle thresholds are millisecond durations, far below i64::MAX.
    #[allow(clippy::cast_possible_wrap)]
    let max_idle = max_idle_ms as i64;
    candidates
        .into_iter()
        .filter(|c| now - c.last_activity > max_idle)
        .collect()
}

/// Picks victims to release at least `overflow_bytes`, least-worth-keeping
/// first: lowest `touch + read + hit`, ties broken by oldest access.
#[must_use]
pub fn memory_victims(
    mut candidates: Vec<EvictionCandidate>,
    overflow_bytes: u64,
) -> Vec<EvictionCandidate> {
    if overflow_bytes == 0 {
        return Vec::new();
    }
    candidates.sort_by_key(|c| (c.pressure_score, c.last_activity));
    let mut freed = 0_u64;
    let mut victims = Vec::new();
    for candidate in candidates {
        if freed >= overflow_bytes {
            break;
        }
        freed = freed.saturating_add(candidate.size);
        victims.push(candidate);
    }
    victims
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(key: &str, created: i64, last_activity: i64, frequency: u64) -> EvictionCandidate {
        EvictionCandidate {
            scope: "global".to_string(),
            key: key.to_string(),
            created,
            last_activity,
            frequency,
            pressure_score: frequency,
            size: 10,
        }
    }

    fn keys(candidates: &[EvictionCandidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.key.as_str()).collect()
    }

    #[test]
    fn fifo_orders_by_creation() {
        let ordered = order_for_eviction(
            EvictionMode::Fifo,
            vec![
                candidate("newer", 300, 300, 0),
                candidate("oldest", 100, 900, 0),
                candidate("middle", 200, 100, 0),
            ],
        );
        assert_eq!(keys(&ordered), vec!["oldest", "middle", "newer"]);
    }

    #[test]
    fn lru_orders_by_last_activity() {
        let ordered = order_for_eviction(
            EvictionMode::Lru,
            vec![
                candidate("hot", 100, 900, 0),
                candidate("cold", 100, 100, 0),
                candidate("warm", 100, 500, 0),
            ],
        );
        assert_eq!(keys(&ordered), vec!["cold", "warm", "hot"]);
    }

    #[test]
    fn lfu_orders_by_frequency_then_activity() {
        let ordered = order_for_eviction(
            EvictionMode::Lfu,
            vec![
                candidate("busy", 100, 100, 9),
                candidate("quiet-old", 100, 100, 1),
                candidate("quiet-new", 100, 500, 1),
            ],
        );
        assert_eq!(keys(&ordered), vec!["quiet-old", "quiet-new", "busy"]);
    }

    #[test]
    fn overflow_respects_the_unlimited_boundary() {
        assert_eq!(overflow_count(10, Some(8)), 2);
        assert_eq!(overflow_count(8, Some(8)), 0);
        assert_eq!(overflow_count(u64::MAX, None), 0);
    }

    #[test]
    fn idle_victims_use_a_strict_threshold() {
        let victims = idle_victims(
            vec![
                candidate("fresh", 0, 9_500, 0),
                candidate("stale", 0, 3_000, 0),
                candidate("boundary", 0, 9_000, 0),
            ],
            10_000,
            1_000,
        );
        // Exactly max_idle old is not yet idle; strictly greater is.
        assert_eq!(keys(&victims), vec!["stale"]);
    }

    #[test]
    fn memory_victims_free_just_enough() {
        let mut a = candidate("cold-big", 0, 100, 0);
        a.size = 50;
        let mut b = candidate("cold-small", 0, 200, 0);
        b.size = 30;
        let mut c = candidate("hot", 0, 50, 9);
        c.pressure_score = 9;
        c.size = 100;

        let victims = memory_victims(vec![c, b, a], 60);
        assert_eq!(keys(&victims), vec!["cold-big", "cold-small"]);
    }

    #[test]
    fn memory_victims_empty_without_overflow() {
        assert!(memory_victims(vec![candidate("k", 0, 0, 0)], 0).is_empty());
    }

    #[test]
    fn mode_reasons_match_wire_names() {
        assert_eq!(mode_reason(EvictionMode::Lru), RemoveReason::Lru);
        assert_eq!(mode_reason(EvictionMode::Lfu), RemoveReason::Lfu);
        assert_eq!(mode_reason(EvictionMode::Fifo), RemoveReason::Fifo);
    }
}
