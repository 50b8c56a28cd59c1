//! The KV flavor manager.
//!
//! Owns the scope map, the KV event bus, memory accounting, the eviction
//! debouncer, the idle sweeper, the session controller, and the
//! backup/restore entry points. Removal is event-driven: every removal path
//! emits `remove` (or `bulkRemove`) and the manager's own `BeforeAll`
//! handler detaches the record from its engines and the map.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use cachegrid_core::{
    BulkStatsDelta, CacheFlavor, EventKind, EventPayload, ReadStatus, RecordDescriptor,
    RecordDump, RemoveReason, TtlSpec, Value, DEFAULT_SCOPE, MEMORY_ENGINE,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::clock::now_millis;
use crate::config::{ConfigChange, ManagerConfig};
use crate::engine::{EngineProxy, ReadOutcome};
use crate::error::{CacheError, EngineError, ValidationError};
use crate::eviction::{
    idle_victims, memory_victims, mode_reason, order_for_eviction, overflow_count,
    EvictionCandidate, CLEAR_BATCH_SIZE, EVICTION_DEBOUNCE, IDLE_SWEEP_INTERVAL,
};
use crate::events::{EventBus, Phase};
use crate::managers::{Activity, BlockingFlags, ReadOptions, SetOptions, RESTORE_CONCURRENCY};
use crate::persistence::PersistenceProxy;
use crate::records::{ExpiryNotice, ExpiryTx, KvRecord};
use crate::session::{Session, SessionBackend, SessionController, SessionPolicy};
use crate::tasks::{Debouncer, SingleFlight};

/// KV flavor front: set/read/remove/clear plus eviction, sessions, and
/// backup/restore.
#[derive(Clone)]
pub struct KvManager {
    inner: Arc<KvInner>,
}

pub(crate) struct KvInner {
    weak_self: Weak<KvInner>,
    scopes: DashMap<String, DashMap<String, Arc<KvRecord>>>,
    record_count: AtomicU64,
    size_in_memory: AtomicU64,
    proxy: Arc<EngineProxy>,
    persistence: Arc<PersistenceProxy>,
    bus: Arc<EventBus>,
    config: Arc<ManagerConfig>,
    flags: BlockingFlags,
    sessions: Arc<SessionController>,
    expiry_tx: ExpiryTx,
    evict_debounce: Debouncer,
    free_memory_flight: SingleFlight,
    idle_task: Mutex<Option<JoinHandle<()>>>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KvManager {
    /// Wires a manager over the given proxy, persistence, and config.
    #[must_use]
    pub fn new(
        proxy: Arc<EngineProxy>,
        persistence: Arc<PersistenceProxy>,
        config: Arc<ManagerConfig>,
    ) -> Self {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak_self| KvInner {
            weak_self: weak_self.clone(),
            scopes: DashMap::new(),
            record_count: AtomicU64::new(0),
            size_in_memory: AtomicU64::new(0),
            proxy,
            persistence,
            bus: Arc::new(EventBus::new(CacheFlavor::Kvs)),
            config,
            flags: BlockingFlags::default(),
            sessions: SessionController::new(),
            expiry_tx,
            evict_debounce: Debouncer::new(EVICTION_DEBOUNCE),
            free_memory_flight: SingleFlight::default(),
            idle_task: Mutex::new(None),
            background_tasks: Mutex::new(Vec::new()),
        });

        inner
            .sessions
            .bind(Arc::downgrade(&inner) as Weak<dyn SessionBackend>);
        KvInner::install_remove_cascade(&inner);
        KvInner::spawn_expiry_pump(&inner, expiry_rx);
        KvInner::spawn_config_listener(&inner);

        Self { inner }
    }

    /// Stores `value` under `key`, creating or updating the record.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        options: SetOptions,
    ) -> Result<(), CacheError> {
        self.inner.set_with(None, key, value, options).await
    }

    /// Reads the value of `key`, or `None` when no record exists.
    pub async fn read(
        &self,
        key: &str,
        options: ReadOptions,
    ) -> Result<Option<Value>, CacheError> {
        let scope = options.scope.as_deref().unwrap_or(DEFAULT_SCOPE);
        self.inner.read_with(None, scope, key).await
    }

    /// Removes the record of `key`. Returns whether one existed.
    pub async fn remove(&self, key: &str, scope: Option<&str>) -> Result<bool, CacheError> {
        self.inner
            .remove_with(None, scope.unwrap_or(DEFAULT_SCOPE), key, RemoveReason::Manual)
            .await
    }

    /// Refreshes the record's TTL and `last_access` without reading data.
    pub async fn touch(&self, key: &str, scope: Option<&str>) -> Result<bool, CacheError> {
        self.inner
            .touch_inner(scope.unwrap_or(DEFAULT_SCOPE), key)
            .await
    }

    /// Whether a record exists for `key`.
    #[must_use]
    pub fn has(&self, key: &str, scope: Option<&str>) -> bool {
        self.inner
            .get_record(scope.unwrap_or(DEFAULT_SCOPE), key)
            .is_some()
    }

    /// Live record count across all scopes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.record_count.load(Ordering::Acquire)
    }

    /// Sum of `stats.size` over memory-resident records.
    #[must_use]
    pub fn size_in_memory(&self) -> u64 {
        self.inner.size_in_memory.load(Ordering::Acquire)
    }

    /// Keys of a scope, unordered.
    #[must_use]
    pub fn keys(&self, scope: Option<&str>) -> Vec<String> {
        self.inner
            .scopes
            .get(scope.unwrap_or(DEFAULT_SCOPE))
            .map(|scope_map| scope_map.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }

    /// Scope names with live records, unordered.
    #[must_use]
    pub fn scopes(&self) -> Vec<String> {
        self.inner.scopes.iter().map(|e| e.key().clone()).collect()
    }

    /// Removes every record (of one scope, or all scopes) in batches.
    ///
    /// Returns the number of records removed.
    pub async fn clear(&self, scope: Option<&str>) -> Result<u64, CacheError> {
        self.inner.clear_inner(scope).await
    }

    /// Streams every record to the named driver as a backup.
    pub async fn backup(&self, to: &str, name: &str) -> Result<u64, CacheError> {
        self.inner.backup_inner(to, name).await
    }

    /// Re-materializes records from a named backup.
    pub async fn restore(&self, from: &str, name: &str) -> Result<u64, CacheError> {
        self.inner.restore_inner(from, name).await
    }

    /// Runs one idle sweep immediately (the periodic sweeper calls the same
    /// path every five minutes while idle eviction is enabled).
    pub async fn sweep_idle(&self) {
        self.inner.run_idle_sweep().await;
    }

    /// Issues a lock session over this manager's records.
    #[must_use]
    pub fn create_lock_session(&self, policy: SessionPolicy) -> Arc<Session> {
        self.inner.sessions.create(policy)
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionController> {
        &self.inner.sessions
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ManagerConfig> {
        &self.inner.config
    }

    /// Releases sessions, cancels jobs and sweepers, and disposes the bus.
    pub fn teardown(&self) {
        self.inner.teardown();
    }
}

impl KvInner {
    fn get_record(&self, scope: &str, key: &str) -> Option<Arc<KvRecord>> {
        self.scopes
            .get(scope)
            .and_then(|scope_map| scope_map.get(key).map(|r| Arc::clone(&r)))
    }

    fn add_size_in_memory(&self, delta: u64) {
        self.size_in_memory.fetch_add(delta, Ordering::AcqRel);
    }

    fn sub_size_in_memory(&self, delta: u64) {
        let _ = self
            .size_in_memory
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(delta))
            });
    }

    async fn emit_record(
        &self,
        kind: EventKind,
        record: &Arc<KvRecord>,
        reason: Option<RemoveReason>,
    ) {
        let mut payload = EventPayload::new(kind, CacheFlavor::Kvs, record.dump(None).to_item());
        payload.reason = reason;
        self.bus.emit(payload).await;
    }

    // --- Event wiring ---

    /// Registers the `BeforeAll` remove/bulkRemove handlers that detach
    /// records from engines and the scope map.
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

    /// Detaches one record: engines first, then the scope map (invariant
    /// order), then counters, TTL job, and lock waiters.
    async fn detach_record(&self, scope: &str, key: &str) {
        let Some(record) = self.get_record(scope, key) else {
            return;
        };
        let descriptor = record.descriptor().clone();
        if let Err(error) = self.proxy.remove(&descriptor, record.engines()).await {
            tracing::warn!(%error, descriptor = %descriptor, "engine detach failed during remove");
        }
        record.cancel_expiry();

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
                self.sub_size_in_memory(record.stats().size);
            }
        }
        self.scopes.remove_if(scope, |_, scope_map| scope_map.is_empty());

        // Waiters on the lock see the record disappear, not a wedged lock.
        record.lock.force_release();
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
        // A sliding access may have moved the deadline after the timer
        // fired; a stale notice must not expire a fresh record.
        let now = now_millis();
        let due = record
            .stats()
            .dates
            .expire_at
            .is_some_and(|expire_at| expire_at <= now);
        if !due {
            return;
        }
        self.emit_record(EventKind::Expire, &record, None).await;
        self.emit_record(EventKind::Remove, &record, Some(RemoveReason::Expire))
            .await;
    }

    fn spawn_config_listener(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        let mut rx = inner.config.subscribe();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let change = *rx.borrow_and_update();
                let Some(inner) = weak.upgrade() else { break };
                match change {
                    ConfigChange::IdleEnabled(true) => KvInner::start_idle_sweeper(&inner),
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
            interval.tick().await; // first tick is immediate
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

    async fn set_with(
        &self,
        caller: Option<Uuid>,
        key: &str,
        value: Value,
        options: SetOptions,
    ) -> Result<(), CacheError> {
        self.flags.check_operational()?;
        let scope = options
            .scope
            .clone()
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string());
        let descriptor = RecordDescriptor::new(CacheFlavor::Kvs, scope.clone(), key);
        descriptor
            .validate()
            .map_err(ValidationError::Descriptor)?;

        let engines = options
            .store_in
            .clone()
            .unwrap_or_else(|| vec![MEMORY_ENGINE.to_string()]);
        self.proxy.registry().check_known(&engines)?;

        let ttl = options.ttl.unwrap_or_else(|| self.config.default_ttl());
        ttl.validate_for(CacheFlavor::Kvs)
            .map_err(ValidationError::Ttl)?;

        let value_size = value.estimate_size();
        let now = now_millis();

        // A session holding the record serializes outside writers.
        let existing = loop {
            match self.get_record(&scope, key) {
                Some(record) if record.lock.blocks_write_for(caller) => {
                    record.lock.wait_write_allowed(caller).await;
                }
                other => break other,
            }
        };

        if let Some(record) = existing {
            let old_size = record.stats().size;
            self.proxy
                .set(record.descriptor(), record.engines(), value)
                .await?;
            record.mark_update(now, value_size);
            if options.ttl.is_some() {
                record.set_ttl(ttl);
            }
            record.reschedule_expiry(&self.expiry_tx);
            if record.uses_memory() {
                let new_size = record.stats().size;
                if new_size >= old_size {
                    self.add_size_in_memory(new_size - old_size);
                } else {
                    self.sub_size_in_memory(old_size - new_size);
                }
            }
            self.emit_record(EventKind::Update, &record, None).await;
        } else {
            let record = KvRecord::new(scope.clone(), key, engines, ttl, value_size, now);
            self.proxy
                .set(record.descriptor(), record.engines(), value)
                .await?;
            self.scopes
                .entry(scope)
                .or_default()
                .insert(key.to_string(), Arc::clone(&record));
            self.record_count.fetch_add(1, Ordering::AcqRel);
            if record.uses_memory() {
                self.add_size_in_memory(record.stats().size);
            }
            record.reschedule_expiry(&self.expiry_tx);
            self.emit_record(EventKind::Create, &record, None).await;
        }

        self.schedule_evict_check();
        self.check_memory_pressure();
        Ok(())
    }

    async fn read_with(
        &self,
        caller: Option<Uuid>,
        scope: &str,
        key: &str,
    ) -> Result<Option<Value>, CacheError> {
        self.flags.check_operational()?;
        let Some(record) = self.get_record(scope, key) else {
            // No record to dump; the miss payload carries the descriptor.
            let item = serde_json::json!({
                "flavor": CacheFlavor::Kvs,
                "scope": scope,
                "key": key,
            });
            self.bus
                .emit(EventPayload::new(EventKind::Miss, CacheFlavor::Kvs, item))
                .await;
            return Ok(None);
        };

        if record.lock.blocks_read_for(caller) {
            record.lock.wait_read_allowed(caller).await;
        }

        let outcome = self
            .proxy
            .read(record.descriptor(), record.engines())
            .await?;
        match outcome {
            ReadOutcome::Found { value, .. } => {
                let now = now_millis();
                record.mark_read(now);
                record.mark_hit();
                record.reschedule_expiry(&self.expiry_tx);

                let mut payload = EventPayload::new(
                    EventKind::Read,
                    CacheFlavor::Kvs,
                    record.dump(None).to_item(),
                );
                payload.status = Some(ReadStatus::Hit);
                self.bus.emit(payload).await;
                self.emit_record(EventKind::Hit, &record, None).await;
                Ok(Some(value))
            }
            ReadOutcome::Absent => {
                // Mapped but gone from every engine: invariant breach.
                Err(CacheError::Engine(Arc::new(EngineError::Inconsistent {
                    descriptor: record.descriptor().to_string(),
                })))
            }
        }
    }

    async fn remove_with(
        &self,
        caller: Option<Uuid>,
        scope: &str,
        key: &str,
        reason: RemoveReason,
    ) -> Result<bool, CacheError> {
        self.flags.check_operational()?;
        let record = loop {
            match self.get_record(scope, key) {
                Some(record) if record.lock.blocks_write_for(caller) => {
                    record.lock.wait_write_allowed(caller).await;
                }
                other => break other,
            }
        };
        let Some(record) = record else {
            return Ok(false);
        };
        self.emit_record(EventKind::Remove, &record, Some(reason))
            .await;
        Ok(true)
    }

    async fn touch_inner(&self, scope: &str, key: &str) -> Result<bool, CacheError> {
        self.flags.check_operational()?;
        let Some(record) = self.get_record(scope, key) else {
            return Ok(false);
        };
        record.mark_touch(now_millis());
        record.reschedule_expiry(&self.expiry_tx);
        self.emit_record(EventKind::Touch, &record, None).await;
        Ok(true)
    }

    async fn clear_inner(&self, scope: Option<&str>) -> Result<u64, CacheError> {
        let _guard = self.flags.begin(Activity::Clearing)?;

        let targets: Vec<Arc<KvRecord>> = match scope {
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
                batch.iter().map(|r| r.dump(None).to_item()).collect();
            let delta = BulkStatsDelta {
                count: batch.len() as u64,
                size: batch.iter().map(|r| r.stats().size).sum(),
            };
            self.bus
                .emit(EventPayload::bulk_remove(
                    CacheFlavor::Kvs,
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

    fn snapshot_candidates(&self, memory_only: bool) -> Vec<EvictionCandidate> {
        let mut candidates = Vec::new();
        for scope_map in &self.scopes {
            for record in scope_map.iter() {
                if memory_only && !record.uses_memory() {
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
                    size: stats.size,
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
        // Overflow is bounded by the live record count.
        #[allow(clippy::cast_possible_truncation)]
        for victim in ordered.into_iter().take(overflow as usize) {
            if let Some(record) = self.get_record(&victim.scope, &victim.key) {
                self.evict_record(&record, reason).await;
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
                self.evict_record(&record, RemoveReason::Idle).await;
            }
        }
    }

    async fn evict_record(&self, record: &Arc<KvRecord>, reason: RemoveReason) {
        self.emit_record(EventKind::Evict, record, Some(reason)).await;
        self.emit_record(EventKind::Remove, record, Some(reason)).await;
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
                "freeing memory over the configured budget"
            );
            for victim in victims {
                if let Some(record) = self.get_record(&victim.scope, &victim.key) {
                    self.evict_record(&record, RemoveReason::MemoryLimit).await;
                }
            }
        }
    }

    // --- Backup / restore ---

    async fn backup_inner(&self, to: &str, name: &str) -> Result<u64, CacheError> {
        let _guard = self.flags.begin(Activity::BackingUp)?;

        // Snapshot the key set up front; records created mid-backup are not
        // part of this snapshot.
        let records: Vec<Arc<KvRecord>> = self
            .scopes
            .iter()
            .flat_map(|scope_map| {
                scope_map
                    .iter()
                    .map(|r| Arc::clone(&r))
                    .collect::<Vec<_>>()
            })
            .collect();

        let proxy = Arc::clone(&self.proxy);
        self.persistence
            .backup_with(CacheFlavor::Kvs, to, name, |mut stream| async move {
                for record in records {
                    let value = proxy
                        .read(record.descriptor(), record.engines())
                        .await
                        .map_err(|error| anyhow::anyhow!(error))?
                        .into_value();
                    stream.write_record(&record.dump(value)).await?;
                }
                stream.finish().await
            })
            .await
    }

    async fn restore_inner(self: &Arc<Self>, from: &str, name: &str) -> Result<u64, CacheError> {
        let _guard = self.flags.begin(Activity::Restoring)?;
        let mut stream = self
            .persistence
            .restore_from(CacheFlavor::Kvs, from, name)
            .await?;

        let now = now_millis();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(RESTORE_CONCURRENCY));
        let mut tasks: tokio::task::JoinSet<Result<(), CacheError>> = tokio::task::JoinSet::new();
        let mut restored = 0_u64;

        while let Some(dump) = stream.next_record().await.map_err(CacheError::Stream)? {
            if dump.flavor != CacheFlavor::Kvs {
                tracing::warn!(flavor = %dump.flavor, key = %dump.key, "skipping foreign-flavor record in kv restore");
                continue;
            }
            if dump.is_expired_at(now) {
                tracing::debug!(key = %dump.key, "dropping expired record from restore");
                continue;
            }
            // Unknown destination engines are a hard error, before any write.
            self.proxy.registry().check_known(&dump.engines)?;

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let inner = Arc::clone(self);
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

    /// Re-creates one record from its dump, preserving stats and TTL.
    async fn materialize(&self, dump: RecordDump) -> Result<(), CacheError> {
        let value = dump
            .value
            .clone()
            .unwrap_or(Value::Json(serde_json::Value::Null));
        let ttl = TtlSpec {
            value: dump.ttl.value,
            sliding: dump.ttl.sliding,
            policy: cachegrid_core::TtlPolicy::Evict,
        };
        let record = KvRecord::new(
            dump.scope.clone(),
            dump.key.clone(),
            dump.engines.clone(),
            ttl,
            value.estimate_size(),
            dump.stats.dates.created,
        );
        record.restore_stats(dump.stats);

        self.proxy
            .set(record.descriptor(), record.engines(), value)
            .await?;

        let replaced = self
            .scopes
            .entry(dump.scope.clone())
            .or_default()
            .insert(dump.key.clone(), Arc::clone(&record));
        if let Some(previous) = replaced {
            previous.cancel_expiry();
            if previous.uses_memory() {
                self.sub_size_in_memory(previous.stats().size);
            }
        } else {
            self.record_count.fetch_add(1, Ordering::AcqRel);
        }
        if record.uses_memory() {
            self.add_size_in_memory(record.stats().size);
        }
        record.reschedule_expiry(&self.expiry_tx);
        self.emit_record(EventKind::Create, &record, None).await;
        Ok(())
    }

    // --- Teardown ---

    fn teardown(&self) {
        self.sessions.release_all();
        self.evict_debounce.cancel();
        self.stop_idle_sweeper();
        for task in self.background_tasks.lock().drain(..) {
            task.abort();
        }
        for scope_map in &self.scopes {
            for record in scope_map.iter() {
                record.cancel_expiry();
                record.lock.force_release();
            }
        }
        self.bus.dispose();
    }
}

/// Pulls `(scope, key)` out of an event item.
pub(crate) fn item_scope_key(item: &serde_json::Value) -> Option<(String, String)> {
    let scope = item.get("scope")?.as_str()?.to_string();
    let key = item.get("key")?.as_str()?.to_string();
    Some((scope, key))
}

#[async_trait]
impl SessionBackend for KvInner {
    fn resolve(&self, scope: &str, key: &str) -> Option<Arc<KvRecord>> {
        self.get_record(scope, key)
    }

    async fn session_read(
        &self,
        caller: Uuid,
        scope: &str,
        key: &str,
    ) -> Result<Option<Value>, CacheError> {
        self.read_with(Some(caller), scope, key).await
    }

    async fn session_update(
        &self,
        caller: Uuid,
        scope: &str,
        key: &str,
        value: Value,
    ) -> Result<(), CacheError> {
        let options = SetOptions {
            scope: Some(scope.to_string()),
            ..SetOptions::default()
        };
        self.set_with(Some(caller), key, value, options).await
    }

    async fn session_remove(
        &self,
        caller: Uuid,
        scope: &str,
        key: &str,
    ) -> Result<bool, CacheError> {
        self.remove_with(Some(caller), scope, key, RemoveReason::Manual)
            .await
    }
}

impl Drop for KvInner {
    fn drop(&mut self) {
        for task in self.background_tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(task) = self.idle_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cachegrid_core::TtlPolicy;
    use parking_lot::Mutex as PlMutex;

    use super::*;
    use crate::engine::EngineRegistry;
    use crate::error::StateError;
    use crate::persistence::drivers::MemoryDriver;
    use crate::persistence::DriverRegistry;

    fn manager() -> KvManager {
        let registry = Arc::new(EngineRegistry::with_memory());
        let proxy = Arc::new(EngineProxy::new(registry));
        let drivers = Arc::new(DriverRegistry::new());
        drivers.register(Arc::new(MemoryDriver::new())).unwrap();
        let persistence = Arc::new(PersistenceProxy::new(drivers, None));
        let config = Arc::new(ManagerConfig::new(CacheFlavor::Kvs));
        KvManager::new(proxy, persistence, config)
    }

    /// Records `(kind, reason, key)` triples for assertions.
    type EventLog = Arc<PlMutex<Vec<(EventKind, Option<RemoveReason>, String)>>>;

    fn record_events(manager: &KvManager) -> EventLog {
        let log: EventLog = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        manager.events().on_any(
            Phase::AfterAll,
            EventBus::handler(move |payload| {
                let sink = Arc::clone(&sink);
                async move {
                    let key = payload
                        .item
                        .get("key")
                        .and_then(|k| k.as_str())
                        .unwrap_or_default()
                        .to_string();
                    sink.lock().push((payload.kind, payload.reason, key));
                }
            }),
        );
        log
    }

    #[tokio::test]
    async fn set_read_remove_round_trip() {
        let kvs = manager();

        kvs.set("a", Value::string("1"), SetOptions::default())
            .await
            .unwrap();
        assert_eq!(
            kvs.read("a", ReadOptions::default()).await.unwrap(),
            Some(Value::string("1"))
        );
        assert!(kvs.remove("a", None).await.unwrap());
        assert_eq!(kvs.read("a", ReadOptions::default()).await.unwrap(), None);
        assert!(!kvs.has("a", None));
        assert!(!kvs.remove("a", None).await.unwrap());
    }

    #[tokio::test]
    async fn size_tracks_the_scope_maps() {
        let kvs = manager();
        assert_eq!(kvs.size(), 0);

        kvs.set("a", Value::string("1"), SetOptions::default())
            .await
            .unwrap();
        kvs.set(
            "b",
            Value::string("2"),
            SetOptions {
                scope: Some("tenant".to_string()),
                ..SetOptions::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(kvs.size(), 2);
        assert_eq!(kvs.keys(None), vec!["a".to_string()]);
        assert_eq!(kvs.keys(Some("tenant")), vec!["b".to_string()]);

        kvs.remove("a", None).await.unwrap();
        assert_eq!(kvs.size(), 1);
    }

    #[tokio::test]
    async fn update_keeps_a_single_record() {
        let kvs = manager();
        let events = record_events(&kvs);

        kvs.set("k", Value::string("old"), SetOptions::default())
            .await
            .unwrap();
        kvs.set("k", Value::string("new"), SetOptions::default())
            .await
            .unwrap();

        assert_eq!(kvs.size(), 1);
        assert_eq!(
            kvs.read("k", ReadOptions::default()).await.unwrap(),
            Some(Value::string("new"))
        );
        let kinds: Vec<EventKind> = events.lock().iter().map(|(k, _, _)| *k).collect();
        assert!(kinds.contains(&EventKind::Create));
        assert!(kinds.contains(&EventKind::Update));
    }

    #[tokio::test]
    async fn size_in_memory_follows_record_sizes() {
        let kvs = manager();
        assert_eq!(kvs.size_in_memory(), 0);

        kvs.set("a", Value::string("x".repeat(100)), SetOptions::default())
            .await
            .unwrap();
        let after_set = kvs.size_in_memory();
        assert!(after_set >= 100);

        kvs.remove("a", None).await.unwrap();
        assert_eq!(kvs.size_in_memory(), 0);
    }

    #[tokio::test]
    async fn ttl_expiry_removes_the_record_with_expire_reason() {
        let kvs = manager();
        let events = record_events(&kvs);

        kvs.set(
            "x",
            Value::Json(serde_json::json!(42)),
            SetOptions {
                ttl: Some(TtlSpec {
                    value: 50,
                    sliding: false,
                    policy: TtlPolicy::Evict,
                }),
                ..SetOptions::default()
            },
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(kvs.read("x", ReadOptions::default()).await.unwrap(), None);

        let log = events.lock();
        let expire_pos = log
            .iter()
            .position(|(k, _, key)| *k == EventKind::Expire && key == "x")
            .expect("expire event observed");
        let remove_pos = log
            .iter()
            .position(|(k, reason, key)| {
                *k == EventKind::Remove && *reason == Some(RemoveReason::Expire) && key == "x"
            })
            .expect("remove{expire} event observed");
        assert!(expire_pos < remove_pos);
    }

    #[tokio::test]
    async fn lru_eviction_at_capacity_keeps_the_recently_read() {
        let kvs = manager();
        let events = record_events(&kvs);
        kvs.config().set_max_records(Some(2)).unwrap();

        kvs.set("a", Value::Json(serde_json::json!(1)), SetOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        kvs.set("b", Value::Json(serde_json::json!(2)), SetOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        kvs.read("a", ReadOptions::default()).await.unwrap();
        kvs.set("c", Value::Json(serde_json::json!(3)), SetOptions::default())
            .await
            .unwrap();

        // Wait out the debounce window.
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(kvs.has("a", None));
        assert!(kvs.has("c", None));
        assert!(!kvs.has("b", None));
        assert_eq!(kvs.size(), 2);

        assert!(events.lock().iter().any(|(k, reason, key)| {
            *k == EventKind::Remove && *reason == Some(RemoveReason::Lru) && key == "b"
        }));
    }

    #[tokio::test]
    async fn unlimited_max_records_disables_count_eviction() {
        let kvs = manager();
        kvs.config().set_max_records(None).unwrap();

        for i in 0..600 {
            kvs.set(
                &format!("k{i}"),
                Value::Json(serde_json::json!(i)),
                SetOptions::default(),
            )
            .await
            .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(kvs.size(), 600);
    }

    #[tokio::test]
    async fn idle_sweep_evicts_stale_records() {
        let kvs = manager();
        let events = record_events(&kvs);
        kvs.config().set_max_idle(30).unwrap();
        kvs.config().set_idle_enabled(true);

        kvs.set("stale", Value::string("v"), SetOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        kvs.set("fresh", Value::string("v"), SetOptions::default())
            .await
            .unwrap();
        kvs.sweep_idle().await;

        assert!(!kvs.has("stale", None));
        assert!(kvs.has("fresh", None));
        assert!(events.lock().iter().any(|(k, reason, key)| {
            *k == EventKind::Evict && *reason == Some(RemoveReason::Idle) && key == "stale"
        }));
    }

    #[tokio::test]
    async fn memory_pressure_evicts_down_to_budget() {
        let kvs = manager();
        let events = record_events(&kvs);
        kvs.config().set_max_total_size(400).unwrap();

        // Three ~200-byte records blow the 400-byte budget.
        for key in ["a", "b", "c"] {
            kvs.set(key, Value::string("x".repeat(200)), SetOptions::default())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(kvs.size_in_memory() <= 400);
        assert!(kvs.size() < 3);
        assert!(events.lock().iter().any(|(k, reason, _)| {
            *k == EventKind::Remove && *reason == Some(RemoveReason::MemoryLimit)
        }));
    }

    #[tokio::test]
    async fn clear_emits_bulk_remove_and_empties_the_flavor() {
        let kvs = manager();
        let events = record_events(&kvs);

        for i in 0..20 {
            kvs.set(
                &format!("k{i}"),
                Value::Json(serde_json::json!(i)),
                SetOptions::default(),
            )
            .await
            .unwrap();
        }
        let removed = kvs.clear(None).await.unwrap();
        assert_eq!(removed, 20);
        assert_eq!(kvs.size(), 0);
        assert_eq!(kvs.size_in_memory(), 0);

        assert!(events.lock().iter().any(|(k, reason, _)| {
            *k == EventKind::BulkRemove && *reason == Some(RemoveReason::Clear)
        }));
    }

    #[tokio::test]
    async fn clear_of_one_scope_leaves_the_rest() {
        let kvs = manager();
        kvs.set("a", Value::string("1"), SetOptions::default())
            .await
            .unwrap();
        kvs.set(
            "b",
            Value::string("2"),
            SetOptions {
                scope: Some("tenant".to_string()),
                ..SetOptions::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(kvs.clear(Some("tenant")).await.unwrap(), 1);
        assert!(kvs.has("a", None));
        assert!(!kvs.has("b", Some("tenant")));
    }

    #[tokio::test]
    async fn operations_fail_while_clearing() {
        let kvs = manager();
        let guard = kvs.inner.flags.begin(Activity::Clearing).unwrap();

        assert!(matches!(
            kvs.set("k", Value::string("v"), SetOptions::default())
                .await
                .unwrap_err(),
            CacheError::State(StateError::Clearing)
        ));
        assert!(kvs.read("k", ReadOptions::default()).await.is_err());
        assert!(kvs.remove("k", None).await.is_err());

        drop(guard);
        kvs.set("k", Value::string("v"), SetOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_processes_are_mutually_exclusive() {
        let kvs = manager();
        let _guard = kvs.inner.flags.begin(Activity::BackingUp).unwrap();
        assert!(matches!(
            kvs.clear(None).await.unwrap_err(),
            CacheError::State(StateError::Busy { .. })
        ));
        assert!(kvs.restore("mem", "snap").await.is_err());
    }

    #[tokio::test]
    async fn backup_restore_round_trip_preserves_payloads() {
        let kvs = manager();
        for i in 0..50 {
            kvs.set(
                &format!("k{i}"),
                Value::Json(serde_json::json!({ "n": i })),
                SetOptions::default(),
            )
            .await
            .unwrap();
        }

        let written = kvs.backup("mem", "snap").await.unwrap();
        assert_eq!(written, 50);

        kvs.clear(None).await.unwrap();
        assert_eq!(kvs.size(), 0);

        let restored = kvs.restore("mem", "snap").await.unwrap();
        assert_eq!(restored, 50);
        assert_eq!(kvs.size(), 50);
        assert_eq!(
            kvs.read("k7", ReadOptions::default()).await.unwrap(),
            Some(Value::Json(serde_json::json!({ "n": 7 })))
        );
    }

    #[tokio::test]
    async fn restore_drops_already_expired_records() {
        let kvs = manager();
        kvs.set(
            "short",
            Value::string("gone"),
            SetOptions {
                ttl: Some(TtlSpec {
                    value: 60,
                    sliding: false,
                    policy: TtlPolicy::Evict,
                }),
                ..SetOptions::default()
            },
        )
        .await
        .unwrap();
        kvs.set("keeper", Value::string("here"), SetOptions::default())
            .await
            .unwrap();

        kvs.backup("mem", "snap").await.unwrap();

        // Let the short TTL lapse, then restore into a cleared cache.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = kvs.clear(None).await;
        let restored = kvs.restore("mem", "snap").await.unwrap();

        assert_eq!(restored, 1);
        assert!(kvs.has("keeper", None));
        assert!(!kvs.has("short", None));
    }

    #[tokio::test]
    async fn session_locked_record_blocks_outside_writers() {
        let kvs = manager();
        kvs.set("k", Value::string("v"), SetOptions::default())
            .await
            .unwrap();

        let session = kvs.create_lock_session(SessionPolicy::exclusive());
        session
            .acquire(&[crate::session::RecordMeta::key("k")])
            .await
            .unwrap();

        // Outside writer waits; completes only after release.
        let kvs2 = kvs.clone();
        let writer = tokio::spawn(async move {
            kvs2.set("k", Value::string("outside"), SetOptions::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!writer.is_finished(), "outside writer must wait");

        // The holder itself writes through.
        session
            .update("k", None, Value::string("inside"))
            .await
            .unwrap();

        session.release().unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(
            kvs.read("k", ReadOptions::default()).await.unwrap(),
            Some(Value::string("outside"))
        );
    }

    #[tokio::test]
    async fn removing_a_locked_record_unblocks_waiters() {
        let kvs = manager();
        kvs.set("k", Value::string("v"), SetOptions::default())
            .await
            .unwrap();
        let session = kvs.create_lock_session(SessionPolicy::exclusive());
        session
            .acquire(&[crate::session::RecordMeta::key("k")])
            .await
            .unwrap();

        // The holder removes its own record; the lock is force-released in
        // the cascade so nothing stays wedged.
        assert!(session.remove("k", None).await.unwrap());
        assert!(!kvs.has("k", None));

        kvs.set("k", Value::string("fresh"), SetOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn validation_errors_surface_verbatim() {
        let kvs = manager();

        assert!(matches!(
            kvs.set("", Value::string("v"), SetOptions::default())
                .await
                .unwrap_err(),
            CacheError::Validation(ValidationError::Descriptor(_))
        ));
        assert!(matches!(
            kvs.set(
                "k",
                Value::string("v"),
                SetOptions {
                    store_in: Some(vec!["unregistered".to_string()]),
                    ..SetOptions::default()
                }
            )
            .await
            .unwrap_err(),
            CacheError::Validation(ValidationError::UnknownEngine { .. })
        ));
        assert!(matches!(
            kvs.set(
                "k",
                Value::string("v"),
                SetOptions {
                    ttl: Some(TtlSpec {
                        value: 1_000,
                        sliding: false,
                        policy: TtlPolicy::Keep,
                    }),
                    ..SetOptions::default()
                }
            )
            .await
            .unwrap_err(),
            CacheError::Validation(ValidationError::Ttl(_))
        ));
    }

    #[tokio::test]
    async fn touch_refreshes_without_reading() {
        let kvs = manager();
        let events = record_events(&kvs);
        kvs.set("k", Value::string("v"), SetOptions::default())
            .await
            .unwrap();

        assert!(kvs.touch("k", None).await.unwrap());
        assert!(!kvs.touch("ghost", None).await.unwrap());

        let log = events.lock();
        assert!(log.iter().any(|(k, _, key)| *k == EventKind::Touch && key == "k"));
    }

    #[tokio::test]
    async fn miss_event_fires_for_unknown_keys() {
        let kvs = manager();
        let events = record_events(&kvs);

        assert_eq!(kvs.read("nope", ReadOptions::default()).await.unwrap(), None);
        assert!(events
            .lock()
            .iter()
            .any(|(k, _, key)| *k == EventKind::Miss && key == "nope"));
    }

    #[tokio::test]
    async fn teardown_releases_sessions_and_disposes_the_bus() {
        let kvs = manager();
        kvs.set("k", Value::string("v"), SetOptions::default())
            .await
            .unwrap();
        let session = kvs.create_lock_session(SessionPolicy::default());
        session
            .acquire(&[crate::session::RecordMeta::key("k")])
            .await
            .unwrap();

        kvs.teardown();
        assert!(kvs.sessions().is_empty());
        assert!(kvs.events().is_disposed());
    }
}
