//! The KV record: stats, TTL job, and session-lock attachment.

use std::sync::Arc;

use cachegrid_core::{
    CacheFlavor, RecordDescriptor, RecordDump, RecordStats, TtlDump, TtlSpec, Value,
    MEMORY_ENGINE,
};
use parking_lot::Mutex;

use crate::records::ttl::{ExpiryNotice, ExpiryTx, TtlJob};
use crate::session::RecordLock;

/// One live KV entry.
///
/// The value itself lives in the engines named by `engines`; the record is
/// the manager-owned handle carrying stats, the expiration job, and the
/// cooperative lock sessions attach to.
pub struct KvRecord {
    descriptor: RecordDescriptor,
    engines: Vec<String>,
    stats: Mutex<RecordStats>,
    ttl: Mutex<TtlSpec>,
    ttl_job: TtlJob,
    pub(crate) lock: RecordLock,
}

impl KvRecord {
    /// Creates a record for a value of estimated size `value_size`.
    ///
    /// `stats.size` follows the documented estimate:
    /// `bytelen(key) + estimate(value)`.
    #[must_use]
    pub fn new(
        scope: impl Into<String>,
        key: impl Into<String>,
        engines: Vec<String>,
        ttl: TtlSpec,
        value_size: u64,
        now: i64,
    ) -> Arc<Self> {
        let descriptor = RecordDescriptor::new(CacheFlavor::Kvs, scope, key);
        let size = descriptor.key.len() as u64 + value_size;
        Arc::new(Self {
            descriptor,
            engines,
            stats: Mutex::new(RecordStats::new(now, size)),
            ttl: Mutex::new(ttl),
            ttl_job: TtlJob::new(),
            lock: RecordLock::default(),
        })
    }

    #[must_use]
    pub fn descriptor(&self) -> &RecordDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.descriptor.scope
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.descriptor.key
    }

    #[must_use]
    pub fn engines(&self) -> &[String] {
        &self.engines
    }

    /// Whether the record lives in the memory engine (and therefore counts
    /// toward `size_in_memory`).
    #[must_use]
    pub fn uses_memory(&self) -> bool {
        self.engines.iter().any(|name| name == MEMORY_ENGINE)
    }

    #[must_use]
    pub fn stats(&self) -> RecordStats {
        *self.stats.lock()
    }

    /// Replaces the stats wholesale. Restore-path only.
    pub fn restore_stats(&self, stats: RecordStats) {
        *self.stats.lock() = stats;
    }

    #[must_use]
    pub fn ttl(&self) -> TtlSpec {
        *self.ttl.lock()
    }

    pub fn set_ttl(&self, spec: TtlSpec) {
        *self.ttl.lock() = spec;
    }

    pub fn mark_read(&self, now: i64) {
        self.stats.lock().on_read(now);
    }

    pub fn mark_touch(&self, now: i64) {
        self.stats.lock().on_touch(now);
    }

    pub fn mark_update(&self, now: i64, value_size: u64) {
        let mut stats = self.stats.lock();
        let size = self.descriptor.key.len() as u64 + value_size;
        stats.on_update(now, size);
    }

    pub fn mark_hit(&self) {
        self.stats.lock().on_hit();
    }

    pub fn mark_miss(&self) {
        self.stats.lock().on_miss();
    }

    /// Recomputes `expire_at` from the TTL spec and reschedules the job.
    ///
    /// Sliding specs anchor on the last access, fixed specs on creation; a
    /// disabled TTL cancels any live job. The job is left alone when the
    /// instant did not move.
    pub fn reschedule_expiry(&self, tx: &ExpiryTx) {
        let spec = self.ttl();
        let instant = {
            let mut stats = self.stats.lock();
            let instant = spec.expire_instant(stats.dates.created, stats.dates.last_access);
            stats.dates.expire_at = instant;
            instant
        };
        match instant {
            Some(fire_at) => self.ttl_job.schedule(
                fire_at,
                ExpiryNotice {
                    scope: self.descriptor.scope.clone(),
                    key: self.descriptor.key.clone(),
                    policy: spec.policy,
                },
                tx.clone(),
            ),
            None => self.ttl_job.cancel(),
        }
    }

    /// Cancels the expiration job (record removal, teardown). Idempotent.
    pub fn cancel_expiry(&self) {
        self.ttl_job.cancel();
        self.stats.lock().dates.expire_at = None;
    }

    /// Instant of the live expiration job, if any. Test hook.
    #[must_use]
    pub fn expiry_scheduled_at(&self) -> Option<i64> {
        self.ttl_job.scheduled_at()
    }

    /// The export form, embedding the engine-resident value when provided.
    #[must_use]
    pub fn dump(&self, value: Option<Value>) -> RecordDump {
        let ttl = self.ttl();
        RecordDump {
            flavor: CacheFlavor::Kvs,
            engines: self.engines.clone(),
            scope: self.descriptor.scope.clone(),
            key: self.descriptor.key.clone(),
            stats: self.stats(),
            ttl: TtlDump {
                value: ttl.value,
                sliding: ttl.sliding,
            },
            value,
            file: None,
        }
    }
}
