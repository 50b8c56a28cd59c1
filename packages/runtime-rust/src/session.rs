//! Cooperative session locking over KV records.
//!
//! A [`SessionController`] issues [`Session`] handles that acquire
//! exclusive or shared locks on a set of records. Locks are cooperative:
//! the manager consults them on every write (and, for `block_read` holders,
//! on reads), so all serialization happens through the manager's normal
//! paths rather than through the records themselves.
//!
//! Lifecycle: Created -> AcquiringPending -> Holding -> Released. A session
//! releases explicitly, on timeout (non-exclusive sessions only), or when
//! the cache tears down.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use cachegrid_core::{Value, DEFAULT_SCOPE};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::CacheError;
use crate::records::KvRecord;

/// Default timeout of non-exclusive sessions.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Typed session error codes, surfaced verbatim to the session caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session timed out before release")]
    Timeout,
    #[error("session was already released")]
    AlreadyReleased,
    #[error("no record at {scope}/{key}")]
    RecordNotFound { scope: String, key: String },
    #[error("record {scope}/{key} is not acquired by this session")]
    RecordNotAcquired { scope: String, key: String },
    #[error("record {scope}/{key} is exclusively locked by another session")]
    RecordIsExclusive { scope: String, key: String },
}

impl SessionError {
    /// Stable wire code of this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "SESSION_TIMEOUT",
            Self::AlreadyReleased => "SESSION_ALREADY_RELEASED",
            Self::RecordNotFound { .. } => "SESSION_RECORD_NOT_FOUND",
            Self::RecordNotAcquired { .. } => "SESSION_RECORD_NOT_ACQUIRED",
            Self::RecordIsExclusive { .. } => "SESSION_RECORD_IS_EXCLUSIVE",
        }
    }
}

/// The manager surface sessions operate through.
///
/// Implemented by the KV manager; the indirection breaks the cycle between
/// sessions, records, and the manager that owns both.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Looks up a live record.
    fn resolve(&self, scope: &str, key: &str) -> Option<Arc<KvRecord>>;

    /// Reads on behalf of a session (lock checks use the caller identity).
    async fn session_read(
        &self,
        caller: Uuid,
        scope: &str,
        key: &str,
    ) -> Result<Option<Value>, CacheError>;

    /// Updates a record the session holds.
    async fn session_update(
        &self,
        caller: Uuid,
        scope: &str,
        key: &str,
        value: Value,
    ) -> Result<(), CacheError>;

    /// Removes a record the session holds.
    async fn session_remove(
        &self,
        caller: Uuid,
        scope: &str,
        key: &str,
    ) -> Result<bool, CacheError>;
}

/// The lock attachment point carried by every KV record.
#[derive(Default)]
pub struct RecordLock {
    holder: Mutex<Option<LockHolder>>,
    released: Notify,
}

/// The session currently attached to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockHolder {
    pub session: Uuid,
    pub exclusive: bool,
    pub block_read: bool,
}

/// Outcome of one attach attempt.
enum AttachOutcome {
    Attached,
    MustWait,
    Exclusive,
}

impl RecordLock {
    #[must_use]
    pub fn holder(&self) -> Option<LockHolder> {
        *self.holder.lock()
    }

    /// Whether a write by `caller` must wait for the current holder.
    #[must_use]
    pub fn blocks_write_for(&self, caller: Option<Uuid>) -> bool {
        self.holder()
            .is_some_and(|holder| Some(holder.session) != caller)
    }

    /// Whether a read by `caller` must wait for the current holder.
    #[must_use]
    pub fn blocks_read_for(&self, caller: Option<Uuid>) -> bool {
        self.holder()
            .is_some_and(|holder| holder.block_read && Some(holder.session) != caller)
    }

    fn try_attach(&self, candidate: LockHolder) -> AttachOutcome {
        let mut holder = self.holder.lock();
        match *holder {
            None => {
                *holder = Some(candidate);
                AttachOutcome::Attached
            }
            Some(current) if current.exclusive => AttachOutcome::Exclusive,
            Some(_) => AttachOutcome::MustWait,
        }
    }

    /// Detaches `session` if it is the holder, waking waiters.
    pub fn detach(&self, session: Uuid) {
        let mut holder = self.holder.lock();
        if holder.is_some_and(|current| current.session == session) {
            *holder = None;
            drop(holder);
            self.released.notify_waiters();
        }
    }

    /// Clears any holder unconditionally (record removal, teardown).
    pub(crate) fn force_release(&self) {
        *self.holder.lock() = None;
        self.released.notify_waiters();
    }

    /// Waits until no holder blocks `caller`'s write.
    pub async fn wait_write_allowed(&self, caller: Option<Uuid>) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.blocks_write_for(caller) {
                return;
            }
            notified.await;
        }
    }

    /// Waits until no holder blocks `caller`'s read.
    pub async fn wait_read_allowed(&self, caller: Option<Uuid>) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.blocks_read_for(caller) {
                return;
            }
            notified.await;
        }
    }

    /// Waits until the lock has no holder at all.
    async fn wait_unheld(&self) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.holder().is_none() {
                return;
            }
            notified.await;
        }
    }
}

/// Lock policy of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Deny other sessions' acquisitions outright instead of queueing them.
    pub exclusive: bool,
    /// Make outside reads wait for release.
    pub block_read: bool,
    /// Auto-release deadline. `None` for exclusive sessions.
    pub timeout: Option<Duration>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            exclusive: false,
            block_read: false,
            timeout: Some(DEFAULT_SESSION_TIMEOUT),
        }
    }
}

impl SessionPolicy {
    /// An exclusive session; exclusive sessions have no timeout.
    #[must_use]
    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            block_read: false,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_block_read(mut self) -> Self {
        self.block_read = true;
        self
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    AcquiringPending,
    Holding,
    Released,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    TimedOut,
}

/// Identifies a record a session wants to acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub key: String,
    pub scope: Option<String>,
}

impl RecordMeta {
    #[must_use]
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            scope: None,
        }
    }

    #[must_use]
    pub fn scoped(key: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            scope: Some(scope.into()),
        }
    }

    fn scope_or_default(&self) -> String {
        self.scope
            .clone()
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string())
    }
}

type RecordKey = (String, String);

/// One cooperative lock session.
pub struct Session {
    id: Uuid,
    policy: SessionPolicy,
    state: Mutex<SessionState>,
    pending: Mutex<HashSet<RecordKey>>,
    locked: Mutex<HashMap<RecordKey, Arc<KvRecord>>>,
    released: watch::Sender<Option<ReleaseOutcome>>,
    controller: Weak<SessionController>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Keys currently locked by this session.
    #[must_use]
    pub fn locked_keys(&self) -> Vec<RecordKey> {
        self.locked.lock().keys().cloned().collect()
    }

    fn backend(&self) -> Result<Arc<dyn SessionBackend>, SessionError> {
        self.controller
            .upgrade()
            .and_then(|controller| controller.backend())
            .ok_or(SessionError::AlreadyReleased)
    }

    /// Acquires locks on every record named by `metas`.
    ///
    /// Records pending under another session are awaited (that session's
    /// timeout counts as release). A record exclusively held by another
    /// session fails the acquire with `SESSION_RECORD_IS_EXCLUSIVE`;
    /// records locked earlier in the same call stay locked.
    pub async fn acquire(self: &Arc<Self>, metas: &[RecordMeta]) -> Result<(), SessionError> {
        let controller = self
            .controller
            .upgrade()
            .ok_or(SessionError::AlreadyReleased)?;
        let backend = self.backend()?;

        {
            let mut state = self.state.lock();
            if *state == SessionState::Released {
                return Err(SessionError::AlreadyReleased);
            }
            *state = SessionState::AcquiringPending;
        }

        // Resolve every meta up front; a missing record fails the whole call.
        let mut records = Vec::with_capacity(metas.len());
        for meta in metas {
            let scope = meta.scope_or_default();
            let record = backend.resolve(&scope, &meta.key).ok_or_else(|| {
                SessionError::RecordNotFound {
                    scope: scope.clone(),
                    key: meta.key.clone(),
                }
            })?;
            records.push(((scope, meta.key.clone()), record));
        }

        // Wait out other sessions' pending claims, then claim as pending.
        for (record_key, _) in &records {
            loop {
                let other = controller
                    .pending
                    .get(record_key)
                    .map(|entry| *entry.value())
                    .filter(|owner| *owner != self.id);
                let Some(owner) = other else { break };
                if let Some(owner_session) = controller.get(owner) {
                    // A timed-out owner reads as available.
                    let _ = owner_session.until_released().await;
                } else {
                    controller
                        .pending
                        .remove_if(record_key, |_, claimed| *claimed == owner);
                }
            }
            controller.pending.insert(record_key.clone(), self.id);
            self.pending.lock().insert(record_key.clone());
        }

        // Single-flight locker: one session attaches at a time.
        let locker = controller.locker.lock().await;
        let candidate = LockHolder {
            session: self.id,
            exclusive: self.policy.exclusive,
            block_read: self.policy.block_read,
        };
        let mut failure = None;
        for ((scope, key), record) in records {
            let attached = loop {
                match record.lock.try_attach(candidate) {
                    AttachOutcome::Attached => break true,
                    AttachOutcome::MustWait => record.lock.wait_unheld().await,
                    AttachOutcome::Exclusive => break false,
                }
            };
            let record_key = (scope.clone(), key.clone());
            if attached {
                self.pending.lock().remove(&record_key);
                controller
                    .pending
                    .remove_if(&record_key, |_, claimed| *claimed == self.id);
                self.locked.lock().insert(record_key, record);
            } else {
                failure = Some(SessionError::RecordIsExclusive { scope, key });
                break;
            }
        }
        drop(locker);

        // Clear any pending marks that did not become locks.
        for record_key in self.pending.lock().drain() {
            controller
                .pending
                .remove_if(&record_key, |_, claimed| *claimed == self.id);
        }

        *self.state.lock() = if self.locked.lock().is_empty() && failure.is_some() {
            SessionState::Created
        } else {
            SessionState::Holding
        };

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Reads a record. Allowed against records this session has not locked;
    /// waits when another session holds the record with `block_read`.
    pub async fn read(
        &self,
        key: &str,
        scope: Option<&str>,
    ) -> Result<Option<Value>, CacheError> {
        self.ensure_active()?;
        let backend = self.backend()?;
        let scope = scope.unwrap_or(DEFAULT_SCOPE);
        backend.session_read(self.id, scope, key).await
    }

    /// Updates a record this session holds.
    pub async fn update(
        &self,
        key: &str,
        scope: Option<&str>,
        value: Value,
    ) -> Result<(), CacheError> {
        self.ensure_active()?;
        let scope = scope.unwrap_or(DEFAULT_SCOPE);
        self.ensure_acquired(scope, key)?;
        let backend = self.backend()?;
        backend.session_update(self.id, scope, key, value).await
    }

    /// Removes a record this session holds.
    pub async fn remove(&self, key: &str, scope: Option<&str>) -> Result<bool, CacheError> {
        self.ensure_active()?;
        let scope = scope.unwrap_or(DEFAULT_SCOPE);
        self.ensure_acquired(scope, key)?;
        let backend = self.backend()?;
        backend.session_remove(self.id, scope, key).await
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.state() == SessionState::Released {
            return Err(SessionError::AlreadyReleased);
        }
        Ok(())
    }

    fn ensure_acquired(&self, scope: &str, key: &str) -> Result<(), SessionError> {
        let record_key = (scope.to_string(), key.to_string());
        if self.locked.lock().contains_key(&record_key) {
            Ok(())
        } else {
            Err(SessionError::RecordNotAcquired {
                scope: scope.to_string(),
                key: key.to_string(),
            })
        }
    }

    /// Explicitly releases the session.
    pub fn release(&self) -> Result<(), SessionError> {
        self.release_with(ReleaseOutcome::Released)
    }

    fn release_with(&self, outcome: ReleaseOutcome) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Released {
                return Err(SessionError::AlreadyReleased);
            }
            *state = SessionState::Released;
        }

        if let Some(task) = self.timeout_task.lock().take() {
            task.abort();
        }

        for (_, record) in self.locked.lock().drain() {
            record.lock.detach(self.id);
        }

        if let Some(controller) = self.controller.upgrade() {
            for record_key in self.pending.lock().drain() {
                controller
                    .pending
                    .remove_if(&record_key, |_, claimed| *claimed == self.id);
            }
            controller.sessions.remove(&self.id);
        }

        let _ = self.released.send(Some(outcome));
        Ok(())
    }

    /// Resolves once the session releases.
    ///
    /// A timed-out session surfaces `SESSION_TIMEOUT`; waiters that only
    /// care about availability treat that the same as a release.
    pub async fn until_released(&self) -> Result<(), SessionError> {
        let mut rx = self.released.subscribe();
        loop {
            if let Some(outcome) = *rx.borrow_and_update() {
                return match outcome {
                    ReleaseOutcome::Released => Ok(()),
                    ReleaseOutcome::TimedOut => Err(SessionError::Timeout),
                };
            }
            if rx.changed().await.is_err() {
                // Sender gone means the session is gone; treat as released.
                return Ok(());
            }
        }
    }
}

/// Issues and tracks sessions for one KV manager.
pub struct SessionController {
    sessions: DashMap<Uuid, Arc<Session>>,
    pending: DashMap<RecordKey, Uuid>,
    locker: tokio::sync::Mutex<()>,
    backend: Mutex<Option<Weak<dyn SessionBackend>>>,
}

impl SessionController {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            pending: DashMap::new(),
            locker: tokio::sync::Mutex::new(()),
            backend: Mutex::new(None),
        })
    }

    /// Binds the manager backend. Called once during manager construction.
    pub(crate) fn bind(&self, backend: Weak<dyn SessionBackend>) {
        *self.backend.lock() = Some(backend);
    }

    fn backend(&self) -> Option<Arc<dyn SessionBackend>> {
        self.backend.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Creates a session. Exclusive sessions never time out; others default
    /// to [`DEFAULT_SESSION_TIMEOUT`] unless the policy overrides it.
    pub fn create(self: &Arc<Self>, mut policy: SessionPolicy) -> Arc<Session> {
        if policy.exclusive {
            policy.timeout = None;
        }
        let (released, _) = watch::channel(None);
        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            policy,
            state: Mutex::new(SessionState::Created),
            pending: Mutex::new(HashSet::new()),
            locked: Mutex::new(HashMap::new()),
            released,
            controller: Arc::downgrade(self),
            timeout_task: Mutex::new(None),
        });
        self.sessions.insert(session.id, Arc::clone(&session));

        if let Some(timeout) = policy.timeout {
            let weak = Arc::downgrade(&session);
            let task = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(session) = weak.upgrade() {
                    let _ = session.release_with(ReleaseOutcome::TimedOut);
                }
            });
            *session.timeout_task.lock() = Some(task);
        }
        session
    }

    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| Arc::clone(&entry))
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Releases every live session (cache teardown).
    pub fn release_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(&entry))
            .collect();
        for session in sessions {
            let _ = session.release();
        }
    }
}
