//! The file flavor manager.
//!
//! Registers file records against on-disk files, caches their content
//! through the engine proxy, and keeps the records in sync with the
//! filesystem via watch events: in-place modifications reload cached
//! content, deletions remove the record, renames migrate the key, and
//! growth past the size quota invalidates the record.
//!
//! Memory pressure differs from KV: over-budget file records are not
//! removed, only their cached content is dropped; the record stays and
//! re-caches on the next read.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use cachegrid_core::{
    file_key, normalize_path, BulkStatsDelta, CacheFlavor, EventKind, EventPayload, ReadStatus,
    RecordDump, RemoveReason, TtlPolicy, TtlSpec, Value, DEFAULT_SCOPE, MEMORY_ENGINE,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::now_millis;
use crate::config::{ConfigChange, ManagerConfig};
use crate::engine::{EngineProxy, ReadOutcome};
use crate::error::{CacheError, ValidationError};
use crate::eviction::{
    idle_victims, memory_victims, mode_reason, order_for_eviction, overflow_count,
    EvictionCandidate, CLEAR_BATCH_SIZE, EVICTION_DEBOUNCE, IDLE_SWEEP_INTERVAL,
};
use crate::events::{EventBus, Phase};
use crate::managers::kv::item_scope_key;
use crate::managers::{Activity, BlockingFlags, RESTORE_CONCURRENCY};
use crate::persistence::PersistenceProxy;
use crate::records::{ExpiryNotice, ExpiryTx, FileInfo, FileRecord};
use crate::tasks::{Debouncer, SingleFlight};
use crate::watch::{PathWatcher, WatchEvent};

/// Options of a file `set` (record registration).
#[derive(Debug, Clone, Default)]
pub struct FileSetOptions {
    pub scope: Option<String>,
    pub ttl: Option<TtlSpec>,
    pub store_in: Option<Vec<String>>,
    /// Cache the content eagerly instead of on first read.
    pub load_content: bool,
}

/// Options of a file `read`.
#[derive(Debug, Clone)]
pub struct FileReadOptions {
    pub file_path: PathBuf,
    pub scope: Option<String>,
}

impl FileReadOptions {
    #[must_use]
    pub fn path(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            scope: None,
        }
    }
}

/// File flavor front.
#[derive(Clone)]
pub struct FileManager {
    inner: Arc<FileInner>,
}

struct FileInner {
    weak_self: Weak<FileInner>,
    scopes: DashMap<String, DashMap<String, Arc<FileRecord>>>,
    record_count: AtomicU64,
    /// Sum of cached content sizes over memory-resident records.
    size_in_memory: AtomicU64,
    proxy: Arc<EngineProxy>,
    persistence: Arc<PersistenceProxy>,
    bus: Arc<EventBus>,
    config: Arc<ManagerConfig>,
    flags: BlockingFlags,
    watcher: Arc<dyn PathWatcher>,
    watch_tx: mpsc::UnboundedSender<(PathBuf, WatchEvent)>,
    expiry_tx: ExpiryTx,
    evict_debounce: Debouncer,
    free_memory_flight: SingleFlight,
    idle_task: Mutex<Option<JoinHandle<()>>>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FileManager {
    #[must_use]
    pub fn new(
        proxy: Arc<EngineProxy>,
        persistence: Arc<PersistenceProxy>,
        config: Arc<ManagerConfig>,
        watcher: Arc<dyn PathWatcher>,
    ) -> Self {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak_self| FileInner {
            weak_self: weak_self.clone(),
            scopes: DashMap::new(),
            record_count: AtomicU64::new(0),
            size_in_memory: AtomicU64::new(0),
            proxy,
            persistence,
            bus: Arc::new(EventBus::new(CacheFlavor::Files)),
            config,
            flags: BlockingFlags::default(),
            watcher,
            watch_tx,
            expiry_tx,
            evict_debounce: Debouncer::new(EVICTION_DEBOUNCE),
            free_memory_flight: SingleFlight::default(),
            idle_task: Mutex::new(None),
            background_tasks: Mutex::new(Vec::new()),
        });

        FileInner::install_remove_cascade(&inner);
        FileInner::spawn_expiry_pump(&inner, expiry_rx);
        FileInner::spawn_watch_pump(&inner, watch_rx);
        FileInner::spawn_config_listener(&inner);

        Self { inner }
    }

    /// Registers a file record for `file_path`.
    pub async fn set(
        &self,
        file_path: impl AsRef<Path>,
        options: FileSetOptions,
    ) -> Result<(), CacheError> {
        self.inner.set_inner(file_path.as_ref(), options).await
    }

    /// Reads the file's content, loading and caching it on first access.
    pub async fn read(&self, options: FileReadOptions) -> Result<Option<Bytes>, CacheError> {
        self.inner.read_inner(&options).await
    }

    /// Removes the record of `file_path`. Returns whether one existed.
    pub async fn remove(
        &self,
        file_path: impl AsRef<Path>,
        scope: Option<&str>,
    ) -> Result<bool, CacheError> {
        self.inner
            .remove_inner(file_path.as_ref(), scope.unwrap_or(DEFAULT_SCOPE))
            .await
    }

    /// Refreshes TTL and `last_access` without touching content.
    pub async fn touch(
        &self,
        file_path: impl AsRef<Path>,
        scope: Option<&str>,
    ) -> Result<bool, CacheError> {
        self.inner
            .touch_inner(file_path.as_ref(), scope.unwrap_or(DEFAULT_SCOPE))
            .await
    }

    /// Drops the cached content of `file_path` while keeping the record.
    pub async fn clear_content(
        &self,
        file_path: impl AsRef<Path>,
        scope: Option<&str>,
    ) -> Result<bool, CacheError> {
        let scope = scope.unwrap_or(DEFAULT_SCOPE);
        let key = file_key(&normalize_path(file_path.as_ref()));
        let Some(record) = self.inner.get_record(scope, &key) else {
            return Ok(false);
        };
        self.inner.clear_record_content(&record).await;
        Ok(true)
    }

    #[must_use]
    pub fn has(&self, file_path: impl AsRef<Path>, scope: Option<&str>) -> bool {
        let key = file_key(&normalize_path(file_path.as_ref()));
        self.inner
            .get_record(scope.unwrap_or(DEFAULT_SCOPE), &key)
            .is_some()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.record_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn size_in_memory(&self) -> u64 {
        self.inner.size_in_memory.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn keys(&self, scope: Option<&str>) -> Vec<String> {
        self.inner
            .scopes
            .get(scope.unwrap_or(DEFAULT_SCOPE))
            .map(|scope_map| scope_map.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn scopes(&self) -> Vec<String> {
        self.inner.scopes.iter().map(|e| e.key().clone()).collect()
    }

    /// Removes every record (of one scope, or all) in batches.
    pub async fn clear(&self, scope: Option<&str>) -> Result<u64, CacheError> {
        self.inner.clear_inner(scope).await
    }

    /// Streams every record's metadata to the named driver.
    pub async fn backup(&self, to: &str, name: &str) -> Result<u64, CacheError> {
        self.inner.backup_inner(to, name).await
    }

    /// Re-registers records from a named backup. Records whose file no
    /// longer exists are skipped.
    pub async fn restore(&self, from: &str, name: &str) -> Result<u64, CacheError> {
        self.inner.restore_inner(from, name).await
    }

    /// Runs one idle sweep immediately.
    pub async fn sweep_idle(&self) {
        self.inner.run_idle_sweep().await;
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ManagerConfig> {
        &self.inner.config
    }

    pub fn teardown(&self) {
        self.inner.teardown();
    }
}

impl FileInner {
    fn get_record(&self, scope: &str, key: &str) -> Option<Arc<FileRecord>> {
        self.scopes
            .get(scope)
            .and_then(|scope_map| scope_map.get(key).map(|r| Arc::clone(&r)))
    }

    /// All records (any scope) currently keyed by `path`.
    fn records_for_path(&self, path: &Path) -> Vec<Arc<FileRecord>> {
        let key = file_key(&normalize_path(path));
        self.scopes
            .iter()
            .filter_map(|scope_map| scope_map.get(&key).map(|r| Arc::clone(&r)))
            .collect()
    }

    fn sub_size_in_memory(&self, delta: u64) {
        let _ = self
            .size_in_memory
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(delta))
            });
    }

    fn apply_content_delta(&self, record: &FileRecord, delta: i64) {
        if !record.uses_memory() || delta == 0 {
            return;
        }
        #[allow(clippy::cast_sign_loss)]
        if delta > 0 {
            self.size_in_memory.fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            self.sub_size_in_memory(delta.unsigned_abs());
        }
    }

    async fn emit_record(
        &self,
        kind: EventKind,
        record: &Arc<FileRecord>,
        reason: Option<RemoveReason>,
    ) {
        let mut payload = EventPayload::new(kind, CacheFlavor::Files, record.dump().to_item());
        payload.reason = reason;
        self.bus.emit(payload).await;
    }

    async fn emit_content_delta(&self, record: &Arc<FileRecord>, delta: i64) {
        if delta == 0 {
            return;
        }
        let payload = EventPayload::new(
            EventKind::FileContentSizeChange,
            CacheFlavor::Files,
            record.dump().to_item(),
        )
        .with_delta(delta);
        self.bus.emit(payload).await;
    }

    // --- Event wiring ---

    fn install_remove_cascade(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        inner.bus.on(
            EventKind::Remove,
            Phase::BeforeAll,
            EventBus::handler(move |payload| {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else { return };
                    if let Some((scope, key)) = item_scope_key(&payload.item) {
                        inner.detach_record(&scope, &key).await;
                    }
                }
            }),
        );

        let weak = Arc::downgrade(inner);
        inner.bus.on(
            EventKind::BulkRemove,
            Phase::BeforeAll,
            EventBus::handler(move |payload| {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else { return };
                    let Some(items) = payload.items.as_ref() else {
                        return;
                    };
                    for item in items {
                        if let Some((scope, key)) = item_scope_key(item) {
                            inner.detach_record(&scope, &key).await;
                        }
                    }
                }
            }),
        );
    }

    async fn detach_record(&self, scope: &str, key: &str) {
        let Some(record) = self.get_record(scope, key) else {
            return;
        };
        let descriptor = record.descriptor();
        if let Err(error) = self.proxy.remove(&descriptor, record.engines()).await {
            tracing::warn!(%error, descriptor = %descriptor, "engine detach failed during remove");
        }
        record.cancel_expiry();
        record.detach_watch();

        let removed = self
            .scopes
            .get(scope)
            .is_some_and(|scope_map| scope_map.remove(key).is_some());
        if removed {
            let _ = self
                .record_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                    Some(c.saturating_sub(1))
                });
            if record.uses_memory() {
                self.sub_size_in_memory(record.content_size());
            }
        }
        self.scopes.remove_if(scope, |_, scope_map| scope_map.is_empty());
    }

    fn spawn_expiry_pump(inner: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<ExpiryNotice>) {
        let weak = Arc::downgrade(inner);
        let handle = tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_expiry(notice).await;
            }
        });
        inner.background_tasks.lock().push(handle);
    }

    async fn handle_expiry(&self, notice: ExpiryNotice) {
        if self.flags.check_operational().is_err() {
            return;
        }
        let Some(record) = self.get_record(&notice.scope, &notice.key) else {
            return;
        };
        let due = record
            .stats()
            .dates
            .expire_at
            .is_some_and(|expire_at| expire_at <= now_millis());
        if !due {
            return;
        }
        match notice.policy {
            TtlPolicy::Evict => {
                self.emit_record(EventKind::Expire, &record, None).await;
                self.emit_record(EventKind::Remove, &record, Some(RemoveReason::Expire))
                    .await;
            }
            // Keep: free the cached bytes, keep the record alive.
            TtlPolicy::Keep => {
                self.clear_record_content(&record).await;
                record.cancel_expiry();
            }
            TtlPolicy::Refresh => {
                tracing::warn!(key = %notice.key, "refresh ttl policy is not schedulable yet");
            }
        }
    }

    fn spawn_watch_pump(
        inner: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<(PathBuf, WatchEvent)>,
    ) {
        let weak = Arc::downgrade(inner);
        let handle = tokio::spawn(async move {
            while let Some((path, event)) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_watch_event(&path, event).await;
            }
        });
        inner.background_tasks.lock().push(handle);
    }

    async fn handle_watch_event(&self, path: &Path, event: WatchEvent) {
        for record in self.records_for_path(path) {
            match &event {
                WatchEvent::Modified => self.handle_file_modified(&record).await,
                WatchEvent::Removed | WatchEvent::RootRemoved => {
                    self.emit_record(EventKind::Remove, &record, Some(RemoveReason::FileDelete))
                        .await;
                }
                WatchEvent::Renamed { to } => self.handle_rename(&record, to).await,
            }
        }
    }

    async fn handle_file_modified(&self, record: &Arc<FileRecord>) {
        // Only cached content reacts; uncached records pick the change up
        // on their next read.
        if !record.is_cached() {
            return;
        }
        match self.load_content(record).await {
            Ok(Some(_)) => {
                record.mark_refresh(now_millis());
                record.reschedule_expiry(&self.expiry_tx);
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(path = %record.path().display(), %error, "reload after file change failed");
            }
        }
    }

    async fn handle_rename(&self, record: &Arc<FileRecord>, to: &Path) {
        let was_cached = record.is_cached();
        let old_descriptor = record.descriptor();
        let old_path = record.path();

        if was_cached {
            if let Err(error) = self.proxy.remove(&old_descriptor, record.engines()).await {
                tracing::warn!(%error, "dropping old-key engine entries failed during rename");
            }
            let delta = record.clear_content_size();
            self.apply_content_delta(record, delta);
        }

        let new_path = normalize_path(to);
        let (old_key, new_key) = record.apply_rename(&new_path);
        if let Some(scope_map) = self.scopes.get(record.scope()) {
            scope_map.remove(&old_key);
            scope_map.insert(new_key, Arc::clone(record));
        }

        // Fresh stat and watch subscription for the new path.
        if let Ok(metadata) = tokio::fs::metadata(&new_path).await {
            record.update_stat(metadata.len(), mtime_ms(&metadata));
        }
        record.detach_watch();
        match self.watcher.watch(&new_path, self.watch_tx.clone()) {
            Ok(guard) => record.attach_watch(guard),
            Err(error) => {
                tracing::warn!(path = %new_path.display(), %error, "re-subscribing watch after rename failed");
            }
        }

        let payload = EventPayload::new(
            EventKind::FileRenameChange,
            CacheFlavor::Files,
            record.dump().to_item(),
        )
        .with_paths(
            old_path.to_string_lossy().into_owned(),
            new_path.to_string_lossy().into_owned(),
        );
        self.bus.emit(payload).await;

        if was_cached {
            if let Err(error) = self.load_content(record).await {
                tracing::warn!(%error, "re-caching content after rename failed");
            }
        }
    }

    fn spawn_config_listener(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        let mut rx = inner.config.subscribe();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let change = *rx.borrow_and_update();
                let Some(inner) = weak.upgrade() else { break };
                match change {
                    ConfigChange::IdleEnabled(true) => FileInner::start_idle_sweeper(&inner),
                    ConfigChange::IdleEnabled(false) => inner.stop_idle_sweeper(),
                    ConfigChange::EvictionEnabled(false) => inner.evict_debounce.cancel(),
                    _ => {}
                }
            }
        });
        inner.background_tasks.lock().push(handle);
    }

    fn start_idle_sweeper(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        let mut slot = inner.idle_task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(IDLE_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.run_idle_sweep().await;
            }
        }));
    }

    fn stop_idle_sweeper(&self) {
        if let Some(task) = self.idle_task.lock().take() {
            task.abort();
        }
    }

    // --- Core operations ---

    async fn set_inner(&self, path: &Path, options: FileSetOptions) -> Result<(), CacheError> {
        self.flags.check_operational()?;
        let scope = options
            .scope
            .clone()
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string());
        if scope.is_empty() {
            return Err(ValidationError::Descriptor(
                cachegrid_core::DescriptorError::EmptyScope,
            )
            .into());
        }

        let normalized = normalize_path(path);
        if !normalized.is_absolute() {
            return Err(ValidationError::PathNotAbsolute {
                path: normalized.to_string_lossy().into_owned(),
            }
            .into());
        }

        let engines = options
            .store_in
            .clone()
            .unwrap_or_else(|| vec![MEMORY_ENGINE.to_string()]);
        self.proxy.registry().check_known(&engines)?;

        let ttl = options.ttl.unwrap_or_else(|| self.config.default_ttl());
        ttl.validate_for(CacheFlavor::Files)
            .map_err(ValidationError::Ttl)?;

        let metadata = tokio::fs::metadata(&normalized)
            .await
            .map_err(|source| CacheError::Io {
                path: normalized.to_string_lossy().into_owned(),
                source,
            })?;
        let size = metadata.len();
        let max_file_size = self.config.size().max_file_size;
        // First stat over the quota is a creation error; growth later is an
        // invalidation instead (see handle_file_modified/load_content).
        if size > max_file_size {
            return Err(CacheError::FileTooLarge {
                path: normalized.to_string_lossy().into_owned(),
                size,
                limit: max_file_size,
            });
        }

        let key = file_key(&normalized);
        if let Some(existing) = self.get_record(&scope, &key) {
            existing.update_stat(size, mtime_ms(&metadata));
            existing.mark_refresh(now_millis());
            if options.ttl.is_some() {
                existing.set_ttl(ttl);
            }
            existing.reschedule_expiry(&self.expiry_tx);
            self.emit_record(EventKind::Update, &existing, None).await;
            if options.load_content {
                self.read_record(&existing).await?;
            }
            return Ok(());
        }

        let record = FileRecord::new(
            scope.clone(),
            FileInfo::from_stat(normalized.clone(), size, mtime_ms(&metadata)),
            engines,
            ttl,
            now_millis(),
        );
        match self.watcher.watch(&normalized, self.watch_tx.clone()) {
            Ok(guard) => record.attach_watch(guard),
            Err(error) => {
                tracing::warn!(path = %normalized.display(), %error, "file watch subscription failed");
            }
        }
        self.scopes
            .entry(scope)
            .or_default()
            .insert(key, Arc::clone(&record));
        self.record_count.fetch_add(1, Ordering::AcqRel);
        record.reschedule_expiry(&self.expiry_tx);
        self.emit_record(EventKind::Create, &record, None).await;

        if options.load_content {
            self.read_record(&record).await?;
        }
        self.schedule_evict_check();
        Ok(())
    }

    async fn read_inner(&self, options: &FileReadOptions) -> Result<Option<Bytes>, CacheError> {
        self.flags.check_operational()?;
        let scope = options.scope.as_deref().unwrap_or(DEFAULT_SCOPE);
        let key = file_key(&normalize_path(&options.file_path));
        let Some(record) = self.get_record(scope, &key) else {
            let item = serde_json::json!({
                "flavor": CacheFlavor::Files,
                "scope": scope,
                "key": key,
                "path": options.file_path.to_string_lossy(),
            });
            self.bus
                .emit(EventPayload::new(EventKind::Miss, CacheFlavor::Files, item))
                .await;
            return Ok(None);
        };
        self.read_record(&record).await
    }

    /// Serves the record's content: engine-cached bytes on a hit, a disk
    /// load (stat, quota check, read, store) on a miss.
    async fn read_record(&self, record: &Arc<FileRecord>) -> Result<Option<Bytes>, CacheError> {
        let now = now_millis();
        if record.is_cached() {
            let outcome = self
                .proxy
                .read(&record.descriptor(), record.engines())
                .await?;
            if let ReadOutcome::Found { value, .. } = outcome {
                if let Some(bytes) = value.as_bytes().cloned() {
                    record.mark_read(now);
                    record.mark_hit();
                    record.reschedule_expiry(&self.expiry_tx);
                    let mut payload = EventPayload::new(
                        EventKind::Read,
                        CacheFlavor::Files,
                        record.dump().to_item(),
                    );
                    payload.status = Some(ReadStatus::Hit);
                    self.bus.emit(payload).await;
                    self.emit_record(EventKind::Hit, record, None).await;
                    return Ok(Some(bytes));
                }
            }
            // Accounting said cached but the engines disagree; fall through
            // to a fresh load.
            tracing::warn!(path = %record.path().display(), "cached file content missing from engines; reloading");
        }

        let Some(bytes) = self.load_content(record).await? else {
            return Ok(None);
        };
        record.mark_read(now);
        record.mark_miss();
        record.reschedule_expiry(&self.expiry_tx);
        let mut payload = EventPayload::new(
            EventKind::Read,
            CacheFlavor::Files,
            record.dump().to_item(),
        );
        payload.status = Some(ReadStatus::Miss);
        self.bus.emit(payload).await;
        self.emit_record(EventKind::Miss, record, None).await;
        Ok(Some(bytes))
    }

    /// Loads content from disk into the engines.
    ///
    /// Returns `None` when the record was invalidated (file over quota).
    async fn load_content(&self, record: &Arc<FileRecord>) -> Result<Option<Bytes>, CacheError> {
        let path = record.path();
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|source| CacheError::Io {
                path: path.to_string_lossy().into_owned(),
                source,
            })?;
        let size = metadata.len();
        if size > self.config.size().max_file_size {
            // Grew past the quota after creation: invalidate, not reject.
            self.emit_record(
                EventKind::Remove,
                record,
                Some(RemoveReason::FileExceedSizeLimit),
            )
            .await;
            return Ok(None);
        }
        record.update_stat(size, mtime_ms(&metadata));

        let bytes = Bytes::from(tokio::fs::read(&path).await.map_err(|source| {
            CacheError::Io {
                path: path.to_string_lossy().into_owned(),
                source,
            }
        })?);
        self.proxy
            .set(
                &record.descriptor(),
                record.engines(),
                Value::Bytes(bytes.clone()),
            )
            .await?;

        let delta = record.set_content_size(bytes.len() as u64);
        self.apply_content_delta(record, delta);
        self.emit_content_delta(record, delta).await;
        self.check_memory_pressure();
        Ok(Some(bytes))
    }

    /// Drops cached bytes from the memory engine and zeroes the accounting;
    /// the record stays alive and re-caches on the next read.
    async fn clear_record_content(&self, record: &Arc<FileRecord>) {
        if !record.is_cached() {
            return;
        }
        if record.uses_memory() {
            if let Err(error) = self
                .proxy
                .remove_from(&record.descriptor(), MEMORY_ENGINE)
                .await
            {
                tracing::warn!(%error, "dropping memory-engine file content failed");
            }
        }
        let delta = record.clear_content_size();
        self.apply_content_delta(record, delta);
        self.emit_content_delta(record, delta).await;
    }

    async fn remove_inner(&self, path: &Path, scope: &str) -> Result<bool, CacheError> {
        self.flags.check_operational()?;
        let key = file_key(&normalize_path(path));
        let Some(record) = self.get_record(scope, &key) else {
            return Ok(false);
        };
        self.emit_record(EventKind::Remove, &record, Some(RemoveReason::Manual))
            .await;
        Ok(true)
    }

    async fn touch_inner(&self, path: &Path, scope: &str) -> Result<bool, CacheError> {
        self.flags.check_operational()?;
        let key = file_key(&normalize_path(path));
        let Some(record) = self.get_record(scope, &key) else {
            return Ok(false);
        };
        record.mark_touch(now_millis());
        record.reschedule_expiry(&self.expiry_tx);
        self.emit_record(EventKind::Touch, &record, None).await;
        Ok(true)
    }

    async fn clear_inner(&self, scope: Option<&str>) -> Result<u64, CacheError> {
        let _guard = self.flags.begin(Activity::Clearing)?;

        let targets: Vec<Arc<FileRecord>> = match scope {
            Some(scope) => self
                .scopes
                .get(scope)
                .map(|scope_map| scope_map.iter().map(|r| Arc::clone(&r)).collect())
                .unwrap_or_default(),
            None => self
                .scopes
                .iter()
                .flat_map(|scope_map| {
                    scope_map
                        .iter()
                        .map(|r| Arc::clone(&r))
                        .collect::<Vec<_>>()
                })
                .collect(),
        };

        let mut removed = 0_u64;
        for batch in targets.chunks(CLEAR_BATCH_SIZE) {
            let items: Vec<serde_json::Value> =
                batch.iter().map(|r| r.dump().to_item()).collect();
            let delta = BulkStatsDelta {
                count: batch.len() as u64,
                size: batch.iter().map(|r| r.content_size()).sum(),
            };
            self.bus
                .emit(EventPayload::bulk_remove(
                    CacheFlavor::Files,
                    RemoveReason::Clear,
                    items,
                    delta,
                ))
                .await;
            removed += batch.len() as u64;
        }

        if self.record_count.load(Ordering::Acquire) == 0 {
            self.evict_debounce.cancel();
        }
        Ok(removed)
    }

    // --- Eviction ---

    fn snapshot_candidates(&self, cached_only: bool) -> Vec<EvictionCandidate> {
        let mut candidates = Vec::new();
        for scope_map in &self.scopes {
            for record in scope_map.iter() {
                if cached_only && !(record.is_cached() && record.uses_memory()) {
                    continue;
                }
                let stats = record.stats();
                candidates.push(EvictionCandidate {
                    scope: record.scope().to_string(),
                    key: record.key().to_string(),
                    created: stats.dates.created,
                    last_activity: stats.last_activity(),
                    frequency: stats.frequency(),
                    pressure_score: stats.pressure_score(),
                    size: record.content_size(),
                });
            }
        }
        candidates
    }

    fn schedule_evict_check(&self) {
        let weak = self.weak_self.clone();
        self.evict_debounce.schedule(move || async move {
            if let Some(inner) = weak.upgrade() {
                inner.run_evict_check().await;
            }
        });
    }

    async fn run_evict_check(&self) {
        let config = self.config.eviction();
        if !config.enabled {
            return;
        }
        let len = self.record_count.load(Ordering::Acquire);
        let overflow = overflow_count(len, config.max_records);
        if overflow == 0 {
            return;
        }
        let reason = mode_reason(config.mode);
        let ordered = order_for_eviction(config.mode, self.snapshot_candidates(false));
        #[allow(clippy::cast_possible_truncation)]
        for victim in ordered.into_iter().take(overflow as usize) {
            if let Some(record) = self.get_record(&victim.scope, &victim.key) {
                self.emit_record(EventKind::Evict, &record, Some(reason)).await;
                self.emit_record(EventKind::Remove, &record, Some(reason)).await;
            }
        }
    }

    async fn run_idle_sweep(&self) {
        let idle = self.config.idle();
        if !idle.enabled {
            return;
        }
        let victims = idle_victims(self.snapshot_candidates(false), now_millis(), idle.max_idle_ms);
        for victim in victims {
            if let Some(record) = self.get_record(&victim.scope, &victim.key) {
                self.emit_record(EventKind::Evict, &record, Some(RemoveReason::Idle))
                    .await;
                self.emit_record(EventKind::Remove, &record, Some(RemoveReason::Idle))
                    .await;
            }
        }
    }

    fn check_memory_pressure(&self) {
        let max = self.config.size().max_total_size;
        if self.size_in_memory.load(Ordering::Acquire) <= max {
            return;
        }
        let Some(guard) = self.free_memory_flight.try_begin() else {
            return;
        };
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            let _flight = guard;
            if let Some(inner) = weak.upgrade() {
                inner.free_memory().await;
            }
        });
    }

    /// Unlike KV, memory pressure clears cached content instead of removing
    /// records.
    async fn free_memory(&self) {
        loop {
            let max = self.config.size().max_total_size;
            let used = self.size_in_memory.load(Ordering::Acquire);
            let overflow = used.saturating_sub(max);
            if overflow == 0 {
                return;
            }
            let victims = memory_victims(self.snapshot_candidates(true), overflow);
            if victims.is_empty() {
                return;
            }
            tracing::debug!(
                overflow,
                victims = victims.len(),
                "clearing cached file content over the memory budget"
            );
            for victim in victims {
                if let Some(record) = self.get_record(&victim.scope, &victim.key) {
                    self.clear_record_content(&record).await;
                }
            }
        }
    }

    // --- Backup / restore ---

    async fn backup_inner(&self, to: &str, name: &str) -> Result<u64, CacheError> {
        let _guard = self.flags.begin(Activity::BackingUp)?;

        let records: Vec<Arc<FileRecord>> = self
            .scopes
            .iter()
            .flat_map(|scope_map| {
                scope_map
                    .iter()
                    .map(|r| Arc::clone(&r))
                    .collect::<Vec<_>>()
            })
            .collect();

        self.persistence
            .backup_with(CacheFlavor::Files, to, name, |mut stream| async move {
                for record in records {
                    stream.write_record(&record.dump()).await?;
                }
                stream.finish().await
            })
            .await
    }

    async fn restore_inner(&self, from: &str, name: &str) -> Result<u64, CacheError> {
        let _guard = self.flags.begin(Activity::Restoring)?;
        let mut stream = self
            .persistence
            .restore_from(CacheFlavor::Files, from, name)
            .await?;

        let now = now_millis();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(RESTORE_CONCURRENCY));
        let mut tasks: tokio::task::JoinSet<Result<(), CacheError>> = tokio::task::JoinSet::new();
        let mut restored = 0_u64;

        while let Some(dump) = stream.next_record().await.map_err(CacheError::Stream)? {
            if dump.flavor != CacheFlavor::Files {
                tracing::warn!(flavor = %dump.flavor, key = %dump.key, "skipping foreign-flavor record in files restore");
                continue;
            }
            if dump.is_expired_at(now) {
                tracing::debug!(key = %dump.key, "dropping expired record from restore");
                continue;
            }
            self.proxy.registry().check_known(&dump.engines)?;

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let Some(inner) = self.weak_self.upgrade() else {
                break;
            };
            tasks.spawn(async move {
                let _permit = permit;
                inner.materialize(dump).await
            });
            restored += 1;
        }

        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|error| CacheError::Stream(anyhow::anyhow!(error)))??;
        }
        Ok(restored)
    }

    async fn materialize(&self, dump: RecordDump) -> Result<(), CacheError> {
        let Some(file) = dump.file.as_ref() else {
            tracing::warn!(key = %dump.key, "files record dump without file metadata; skipping");
            return Ok(());
        };
        let path = normalize_path(Path::new(&file.path));
        // The file may be gone since the backup; that is not an error.
        let Ok(metadata) = tokio::fs::metadata(&path).await else {
            tracing::warn!(path = %path.display(), "backing file missing during restore; skipping record");
            return Ok(());
        };

        let ttl = TtlSpec {
            value: dump.ttl.value,
            sliding: dump.ttl.sliding,
            policy: TtlPolicy::Evict,
        };
        let record = FileRecord::new(
            dump.scope.clone(),
            FileInfo::from_stat(path.clone(), metadata.len(), mtime_ms(&metadata)),
            dump.engines.clone(),
            ttl,
            dump.stats.dates.created,
        );
        record.restore_stats(dump.stats);
        // Content is not part of the backup; it re-caches on first read.
        record.clear_content_size();

        match self.watcher.watch(&path, self.watch_tx.clone()) {
            Ok(guard) => record.attach_watch(guard),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "watch subscription failed during restore");
            }
        }

        let replaced = self
            .scopes
            .entry(dump.scope.clone())
            .or_default()
            .insert(record.key(), Arc::clone(&record));
        if let Some(previous) = replaced {
            previous.cancel_expiry();
            previous.detach_watch();
            if previous.uses_memory() {
                self.sub_size_in_memory(previous.content_size());
            }
        } else {
            self.record_count.fetch_add(1, Ordering::AcqRel);
        }
        record.reschedule_expiry(&self.expiry_tx);
        self.emit_record(EventKind::Create, &record, None).await;
        Ok(())
    }

    // --- Teardown ---

    fn teardown(&self) {
        self.evict_debounce.cancel();
        self.stop_idle_sweeper();
        for task in self.background_tasks.lock().drain(..) {
            task.abort();
        }
        for scope_map in &self.scopes {
            for record in scope_map.iter() {
                record.cancel_expiry();
                record.detach_watch();
            }
        }
        self.bus.dispose();
    }
}

impl Drop for FileInner {
    fn drop(&mut self) {
        for task in self.background_tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(task) = self.idle_task.lock().take() {
            task.abort();
        }
    }
}

/// Modification time of a stat result in milliseconds since the epoch.
#[allow(clippy::cast_possible_truncation)]
fn mtime_ms(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |duration| duration.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex as PlMutex;

    use super::*;
    use crate::engine::EngineRegistry;
    use crate::persistence::drivers::MemoryDriver;
    use crate::persistence::DriverRegistry;
    use crate::watch::ManualWatcher;

    struct Fixture {
        files: FileManager,
        watcher: Arc<ManualWatcher>,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(EngineRegistry::with_memory());
        let proxy = Arc::new(EngineProxy::new(registry));
        let drivers = Arc::new(DriverRegistry::new());
        drivers.register(Arc::new(MemoryDriver::new())).unwrap();
        let persistence = Arc::new(PersistenceProxy::new(drivers, None));
        let config = Arc::new(ManagerConfig::new(CacheFlavor::Files));
        let watcher = ManualWatcher::new();
        let files = FileManager::new(
            proxy,
            persistence,
            config,
            Arc::new(Arc::clone(&watcher)),
        );
        Fixture {
            files,
            watcher,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    impl Fixture {
        fn write_file(&self, name: &str, content: &[u8]) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            normalize_path(&path)
        }
    }

    type EventLog = Arc<PlMutex<Vec<(EventKind, Option<RemoveReason>, Option<i64>)>>>;

    fn record_events(files: &FileManager) -> EventLog {
        let log: EventLog = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        files.events().on_any(
            Phase::AfterAll,
            EventBus::handler(move |payload| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push((payload.kind, payload.reason, payload.delta));
                }
            }),
        );
        log
    }

    #[tokio::test]
    async fn set_then_read_serves_file_bytes() {
        let fx = fixture();
        let path = fx.write_file("a.txt", b"file content");

        fx.files.set(&path, FileSetOptions::default()).await.unwrap();
        assert!(fx.files.has(&path, None));
        assert_eq!(fx.files.size(), 1);
        assert_eq!(fx.watcher.subscription_count(), 1);

        let bytes = fx
            .files
            .read(FileReadOptions::path(&path))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bytes.as_ref(), b"file content");
        assert_eq!(fx.files.size_in_memory(), 12);
    }

    #[tokio::test]
    async fn first_read_is_a_miss_then_hits() {
        let fx = fixture();
        let events = record_events(&fx.files);
        let path = fx.write_file("a.txt", b"xyz");
        fx.files.set(&path, FileSetOptions::default()).await.unwrap();

        fx.files.read(FileReadOptions::path(&path)).await.unwrap();
        fx.files.read(FileReadOptions::path(&path)).await.unwrap();

        let log = events.lock();
        let statuses: Vec<EventKind> = log.iter().map(|(k, _, _)| *k).collect();
        assert!(statuses.contains(&EventKind::Miss));
        assert!(statuses.contains(&EventKind::Hit));
        assert!(log
            .iter()
            .any(|(k, _, delta)| *k == EventKind::FileContentSizeChange && *delta == Some(3)));
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_at_creation() {
        let fx = fixture();
        fx.files.config().set_max_file_size(4).unwrap();
        let path = fx.write_file("big.bin", b"way too large");

        let err = fx
            .files
            .set(&path, FileSetOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::FileTooLarge { .. }));
        assert!(!fx.files.has(&path, None));
    }

    #[tokio::test]
    async fn growth_after_create_invalidates_the_record() {
        let fx = fixture();
        let events = record_events(&fx.files);
        fx.files.config().set_max_file_size(8).unwrap();
        let path = fx.write_file("grow.bin", b"ok");

        fx.files
            .set(
                &path,
                FileSetOptions {
                    load_content: true,
                    ..FileSetOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(fx.files.has(&path, None));

        // The file grows past the quota, then changes on disk.
        std::fs::write(&path, b"now it is far too large").unwrap();
        fx.watcher.fire(&path, WatchEvent::Modified);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!fx.files.has(&path, None));
        assert!(events.lock().iter().any(|(k, reason, _)| {
            *k == EventKind::Remove && *reason == Some(RemoveReason::FileExceedSizeLimit)
        }));
    }

    #[tokio::test]
    async fn deleting_the_file_removes_the_record() {
        let fx = fixture();
        let events = record_events(&fx.files);
        let path = fx.write_file("gone.txt", b"data");
        fx.files.set(&path, FileSetOptions::default()).await.unwrap();

        std::fs::remove_file(&path).unwrap();
        fx.watcher.fire(&path, WatchEvent::Removed);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!fx.files.has(&path, None));
        assert!(events.lock().iter().any(|(k, reason, _)| {
            *k == EventKind::Remove && *reason == Some(RemoveReason::FileDelete)
        }));
    }

    #[tokio::test]
    async fn rename_migrates_key_and_content() {
        let fx = fixture();
        let path = fx.write_file("a.txt", b"same bytes");
        fx.files
            .set(
                &path,
                FileSetOptions {
                    load_content: true,
                    ..FileSetOptions::default()
                },
            )
            .await
            .unwrap();
        let old_key = file_key(&path);

        // Track the rename event.
        let renames: Arc<PlMutex<Vec<(String, String)>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&renames);
        fx.files.events().on(
            EventKind::FileRenameChange,
            Phase::Normal,
            EventBus::handler(move |payload| {
                let sink = Arc::clone(&sink);
                async move {
                    if let Some(paths) = payload.paths.as_ref() {
                        sink.lock().push((paths.from.clone(), paths.to.clone()));
                    }
                }
            }),
        );

        // The OS renames the file; the watcher reports it.
        let new_path = fx.dir.path().join("b.txt");
        std::fs::rename(&path, &new_path).unwrap();
        let new_path = normalize_path(&new_path);
        fx.watcher.fire(&path, WatchEvent::Renamed { to: new_path.clone() });
        tokio::time::sleep(Duration::from_millis(150)).await;

        // New path serves the same bytes; the old key is gone.
        let bytes = fx
            .files
            .read(FileReadOptions::path(&new_path))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bytes.as_ref(), b"same bytes");
        assert!(!fx.files.has(&path, None));
        assert!(!fx.files.keys(None).contains(&old_key));
        assert!(fx.files.keys(None).contains(&file_key(&new_path)));

        let log = renames.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, path.to_string_lossy());
        assert_eq!(log[0].1, new_path.to_string_lossy());
    }

    #[tokio::test]
    async fn modify_reloads_cached_content() {
        let fx = fixture();
        let path = fx.write_file("live.txt", b"v1");
        fx.files
            .set(
                &path,
                FileSetOptions {
                    load_content: true,
                    ..FileSetOptions::default()
                },
            )
            .await
            .unwrap();

        std::fs::write(&path, b"v2 longer").unwrap();
        fx.watcher.fire(&path, WatchEvent::Modified);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let bytes = fx
            .files
            .read(FileReadOptions::path(&path))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bytes.as_ref(), b"v2 longer");
        assert_eq!(fx.files.size_in_memory(), 9);
    }

    #[tokio::test]
    async fn clear_content_keeps_the_record_and_frees_memory() {
        let fx = fixture();
        let events = record_events(&fx.files);
        let path = fx.write_file("c.txt", b"cached");
        fx.files
            .set(
                &path,
                FileSetOptions {
                    load_content: true,
                    ..FileSetOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(fx.files.size_in_memory(), 6);

        assert!(fx.files.clear_content(&path, None).await.unwrap());
        assert_eq!(fx.files.size_in_memory(), 0);
        assert!(fx.files.has(&path, None), "record must survive");
        assert!(events
            .lock()
            .iter()
            .any(|(k, _, delta)| *k == EventKind::FileContentSizeChange && *delta == Some(-6)));

        // Next read re-caches from disk.
        let bytes = fx
            .files
            .read(FileReadOptions::path(&path))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bytes.as_ref(), b"cached");
        assert_eq!(fx.files.size_in_memory(), 6);
    }

    #[tokio::test]
    async fn keep_ttl_policy_drops_content_but_keeps_the_record() {
        let fx = fixture();
        let path = fx.write_file("k.txt", b"keepme");
        fx.files
            .set(
                &path,
                FileSetOptions {
                    ttl: Some(TtlSpec {
                        value: 40,
                        sliding: false,
                        policy: TtlPolicy::Keep,
                    }),
                    load_content: true,
                    ..FileSetOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(fx.files.size_in_memory(), 6);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fx.files.has(&path, None), "keep policy must not remove");
        assert_eq!(fx.files.size_in_memory(), 0);
    }

    #[tokio::test]
    async fn memory_pressure_clears_content_instead_of_removing() {
        let fx = fixture();
        fx.files.config().set_max_total_size(10).unwrap();

        let a = fx.write_file("a.bin", &[0_u8; 8]);
        let b = fx.write_file("b.bin", &[0_u8; 8]);
        for path in [&a, &b] {
            fx.files
                .set(
                    path,
                    FileSetOptions {
                        load_content: true,
                        ..FileSetOptions::default()
                    },
                )
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(fx.files.size_in_memory() <= 10);
        assert_eq!(fx.files.size(), 2, "records stay, content goes");
    }

    #[tokio::test]
    async fn clear_empties_the_flavor() {
        let fx = fixture();
        for i in 0..5 {
            let path = fx.write_file(&format!("f{i}.txt"), b"x");
            fx.files.set(&path, FileSetOptions::default()).await.unwrap();
        }
        assert_eq!(fx.files.clear(None).await.unwrap(), 5);
        assert_eq!(fx.files.size(), 0);
        assert_eq!(fx.watcher.subscription_count(), 0, "watches must detach");
    }

    #[tokio::test]
    async fn backup_restore_re_registers_records() {
        let fx = fixture();
        let path = fx.write_file("persist.txt", b"payload");
        fx.files
            .set(
                &path,
                FileSetOptions {
                    load_content: true,
                    ..FileSetOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(fx.files.backup("mem", "snap").await.unwrap(), 1);
        fx.files.clear(None).await.unwrap();
        assert_eq!(fx.files.size(), 0);

        assert_eq!(fx.files.restore("mem", "snap").await.unwrap(), 1);
        assert!(fx.files.has(&path, None));

        // Content was not part of the backup; reads re-cache it.
        let bytes = fx
            .files
            .read(FileReadOptions::path(&path))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bytes.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn restore_skips_records_whose_file_vanished() {
        let fx = fixture();
        let keep = fx.write_file("keep.txt", b"k");
        let gone = fx.write_file("gone.txt", b"g");
        fx.files.set(&keep, FileSetOptions::default()).await.unwrap();
        fx.files.set(&gone, FileSetOptions::default()).await.unwrap();

        fx.files.backup("mem", "snap").await.unwrap();
        fx.files.clear(None).await.unwrap();
        std::fs::remove_file(&gone).unwrap();

        fx.files.restore("mem", "snap").await.unwrap();
        assert!(fx.files.has(&keep, None));
        assert!(!fx.files.has(&gone, None));
    }

    #[tokio::test]
    async fn relative_paths_are_rejected() {
        let fx = fixture();
        let err = fx
            .files
            .set(Path::new("relative/file.txt"), FileSetOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::Validation(ValidationError::PathNotAbsolute { .. })
        ));
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let fx = fixture();
        let path = fx.dir.path().join("never-written.txt");
        let err = fx
            .files
            .set(&path, FileSetOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Io { .. }));
    }

    #[tokio::test]
    async fn read_of_unregistered_path_is_none() {
        let fx = fixture();
        let path = fx.write_file("exists-but-unregistered.txt", b"x");
        assert_eq!(
            fx.files.read(FileReadOptions::path(&path)).await.unwrap(),
            None
        );
    }
}
