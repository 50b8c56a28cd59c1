//! The file record: on-disk mirror state, content cache accounting, and the
//! watch subscription.
//!
//! The record key is derived from the normalized path, so it changes when
//! the file is renamed; the manager drives that migration (old engine slots
//! dropped, key recomputed, content re-cached) off the watch events.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cachegrid_core::{
    file_etag, file_key, CacheFlavor, FileDump, RecordDescriptor, RecordDump, RecordStats,
    TtlDump, TtlSpec, MEMORY_ENGINE,
};
use parking_lot::{Mutex, RwLock};

use crate::records::ttl::{ExpiryNotice, ExpiryTx, TtlJob};
use crate::watch::WatchGuard;

/// Stat-derived identity of the mirrored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Normalized absolute path.
    pub path: PathBuf,
    /// Final path component.
    pub name: String,
    /// Size on disk at the last stat.
    pub size: u64,
    /// `base64("<size>-<mtime_ms>")` of the last stat.
    pub e_tag: String,
}

impl FileInfo {
    /// Builds the info from a normalized path and stat results.
    #[must_use]
    pub fn from_stat(path: PathBuf, size: u64, mtime_ms: i64) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let e_tag = file_etag(size, mtime_ms);
        Self {
            path,
            name,
            size,
            e_tag,
        }
    }
}

/// One live file entry.
pub struct FileRecord {
    scope: String,
    key: RwLock<String>,
    engines: Vec<String>,
    stats: Mutex<RecordStats>,
    ttl: Mutex<TtlSpec>,
    ttl_job: TtlJob,
    file: RwLock<FileInfo>,
    /// Bytes currently cached in memory; 0 when content was evicted.
    content_size: AtomicU64,
    watch_guard: Mutex<Option<Box<dyn WatchGuard>>>,
}

impl FileRecord {
    #[must_use]
    pub fn new(
        scope: impl Into<String>,
        file: FileInfo,
        engines: Vec<String>,
        ttl: TtlSpec,
        now: i64,
    ) -> Arc<Self> {
        let key = file_key(&file.path);
        Arc::new(Self {
            scope: scope.into(),
            key: RwLock::new(key),
            engines,
            stats: Mutex::new(RecordStats::new(now, 0)),
            ttl: Mutex::new(ttl),
            ttl_job: TtlJob::new(),
            file: RwLock::new(file),
            content_size: AtomicU64::new(0),
            watch_guard: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Current key; changes on rename.
    #[must_use]
    pub fn key(&self) -> String {
        self.key.read().clone()
    }

    #[must_use]
    pub fn descriptor(&self) -> RecordDescriptor {
        RecordDescriptor::new(CacheFlavor::Files, self.scope.clone(), self.key())
    }

    #[must_use]
    pub fn engines(&self) -> &[String] {
        &self.engines
    }

    #[must_use]
    pub fn uses_memory(&self) -> bool {
        self.engines.iter().any(|name| name == MEMORY_ENGINE)
    }

    #[must_use]
    pub fn file(&self) -> FileInfo {
        self.file.read().clone()
    }

    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.file.read().path.clone()
    }

    /// Updates size/eTag after a fresh stat of the same path.
    pub fn update_stat(&self, size: u64, mtime_ms: i64) {
        let mut file = self.file.write();
        file.size = size;
        file.e_tag = file_etag(size, mtime_ms);
    }

    /// Applies a rename: new path, name, and derived key.
    ///
    /// Returns `(old_key, new_key)` so the manager can migrate its map and
    /// the engine slots.
    pub fn apply_rename(&self, new_path: &Path) -> (String, String) {
        let new_key = file_key(new_path);
        let old_key = {
            let mut key = self.key.write();
            std::mem::replace(&mut *key, new_key.clone())
        };
        let mut file = self.file.write();
        file.path = new_path.to_path_buf();
        file.name = new_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        (old_key, new_key)
    }

    #[must_use]
    pub fn content_size(&self) -> u64 {
        self.content_size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.content_size() > 0
    }

    /// Records newly cached content, returning the signed size delta.
    pub fn set_content_size(&self, size: u64) -> i64 {
        let previous = self.content_size.swap(size, Ordering::AcqRel);
        self.stats.lock().size = size;
        // Cached sizes are bounded by max_file_size, far below i64::MAX.
        #[allow(clippy::cast_possible_wrap)]
        let delta = size as i64 - previous as i64;
        delta
    }

    /// Drops the content accounting, returning the (negative) delta.
    pub fn clear_content_size(&self) -> i64 {
        self.set_content_size(0)
    }

    #[must_use]
    pub fn stats(&self) -> RecordStats {
        *self.stats.lock()
    }

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

    pub fn mark_refresh(&self, now: i64) {
        self.stats.lock().on_update(now, self.content_size());
    }

    pub fn mark_hit(&self) {
        self.stats.lock().on_hit();
    }

    pub fn mark_miss(&self) {
        self.stats.lock().on_miss();
    }

    /// Recomputes `expire_at` and reschedules the job; see the KV record for
    /// the anchoring rules.
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
                    scope: self.scope.clone(),
                    key: self.key(),
                    policy: spec.policy,
                },
                tx.clone(),
            ),
            None => self.ttl_job.cancel(),
        }
    }

    pub fn cancel_expiry(&self) {
        self.ttl_job.cancel();
        self.stats.lock().dates.expire_at = None;
    }

    /// Installs the watch subscription, replacing (and thereby dropping)
    /// any previous one.
    pub fn attach_watch(&self, guard: Box<dyn WatchGuard>) {
        *self.watch_guard.lock() = Some(guard);
    }

    /// Drops the watch subscription. Idempotent.
    pub fn detach_watch(&self) {
        self.watch_guard.lock().take();
    }

    #[must_use]
    pub fn dump(&self) -> RecordDump {
        let ttl = self.ttl();
        let file = self.file();
        RecordDump {
            flavor: CacheFlavor::Files,
            engines: self.engines.clone(),
            scope: self.scope.clone(),
            key: self.key(),
            stats: self.stats(),
            ttl: TtlDump {
                value: ttl.value,
                sliding: ttl.sliding,
            },
            value: None,
            file: Some(FileDump {
                path: file.path.to_string_lossy().into_owned(),
                name: file.name,
                e_tag: file.e_tag,
                size: file.size,
                is_cached: self.is_cached(),
            }),
        }
    }
}
