//! Per-record access statistics.
//!
//! [`RecordStats`] is tracked for every record and serialized wire-stable
//! (camelCase) into record dumps and event payloads. Timestamps are
//! milliseconds since the Unix epoch, matching the rest of the runtime.

use serde::{Deserialize, Serialize};

/// Lifecycle timestamps of a record.
///
/// `created` is always set; the rest appear once the corresponding access
/// happens. `expire_at` mirrors the instant of the live expiration job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDates {
    /// Wall-clock time (millis since epoch) when the record was created.
    pub created: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_access: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_update: Option<i64>,
    /// Absolute instant the record is scheduled to expire, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expire_at: Option<i64>,
}

/// Access counters of a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordCounts {
    pub read: u64,
    pub update: u64,
    pub touch: u64,
    pub hit: u64,
    pub miss: u64,
}

/// Dates, counts, and the size estimate of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordStats {
    pub dates: RecordDates,
    pub counts: RecordCounts,
    /// Estimated byte cost: `bytelen(key) + estimate(value)` for KV, cached
    /// content size for files.
    pub size: u64,
}

impl RecordStats {
    /// Fresh stats for a record created at `now` with the given size.
    #[must_use]
    pub fn new(now: i64, size: u64) -> Self {
        Self {
            dates: RecordDates {
                created: now,
                last_access: None,
                last_update: None,
                expire_at: None,
            },
            counts: RecordCounts::default(),
            size,
        }
    }

    /// Records a read access.
    pub fn on_read(&mut self, now: i64) {
        self.counts.read = self.counts.read.saturating_add(1);
        self.dates.last_access = Some(now);
    }

    /// Records a touch (TTL refresh without data access).
    pub fn on_touch(&mut self, now: i64) {
        self.counts.touch = self.counts.touch.saturating_add(1);
        self.dates.last_access = Some(now);
    }

    /// Records a write with the updated size estimate.
    pub fn on_update(&mut self, now: i64, size: u64) {
        self.counts.update = self.counts.update.saturating_add(1);
        self.dates.last_update = Some(now);
        self.size = size;
    }

    pub fn on_hit(&mut self) {
        self.counts.hit = self.counts.hit.saturating_add(1);
    }

    pub fn on_miss(&mut self) {
        self.counts.miss = self.counts.miss.saturating_add(1);
    }

    /// Last access instant, falling back to creation.
    ///
    /// This is the ordering key for LRU eviction and the idle sweep.
    #[must_use]
    pub fn last_activity(&self) -> i64 {
        self.dates.last_access.unwrap_or(self.dates.created)
    }

    /// Access frequency score used by LFU ordering (`touch + read`).
    #[must_use]
    pub fn frequency(&self) -> u64 {
        self.counts.touch.saturating_add(self.counts.read)
    }

    /// Pressure score used when freeing memory (`touch + read + hit`).
    #[must_use]
    pub fn pressure_score(&self) -> u64 {
        self.frequency().saturating_add(self.counts.hit)
    }
}
