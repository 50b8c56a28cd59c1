//! Filesystem watch contract for file records.
//!
//! The file manager subscribes each record's path through a [`PathWatcher`]
//! and reacts to the resulting [`WatchEvent`]s (reload, invalidate, rename).
//! The default implementation bridges the `notify` crate's worker-thread
//! callbacks into a tokio channel; [`ManualWatcher`] is the in-process test
//! double.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Something happened to a watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// File content changed in place.
    Modified,
    /// The file itself was deleted.
    Removed,
    /// The directory containing the file was deleted.
    RootRemoved,
    /// The file moved to a new path.
    Renamed { to: PathBuf },
}

/// Channel the watcher delivers `(watched path, event)` pairs on.
pub type WatchTx = mpsc::UnboundedSender<(PathBuf, WatchEvent)>;

/// Subscription handle; dropping it stops delivery for that path.
pub trait WatchGuard: Send + Sync {}

/// Watches a single file path for changes.
///
/// Implementations deliver events on the provided channel tagged with the
/// path that was subscribed (not the event's own path), so the consumer can
/// route by its current record key even across renames.
pub trait PathWatcher: Send + Sync + 'static {
    /// Starts watching `path`. The returned guard owns the subscription.
    fn watch(&self, path: &Path, tx: WatchTx) -> anyhow::Result<Box<dyn WatchGuard>>;
}

/// Default watcher backed by the `notify` crate.
///
/// Watches the file's parent directory non-recursively (rename and delete
/// events are only observable there) and filters events down to the target
/// path.
#[derive(Debug, Default)]
pub struct NotifyWatcher;

struct NotifyGuard {
    _watcher: notify::RecommendedWatcher,
}

impl WatchGuard for NotifyGuard {}

impl PathWatcher for NotifyWatcher {
    fn watch(&self, path: &Path, tx: WatchTx) -> anyhow::Result<Box<dyn WatchGuard>> {
        let target = path.to_path_buf();
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("watched path {} has no parent", path.display()))?
            .to_path_buf();

        let handler_target = target.clone();
        let handler_parent = parent.clone();
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                let Ok(event) = result else { return };
                if let Some(mapped) = map_notify_event(&handler_target, &handler_parent, &event) {
                    // The manager may be gone during teardown; drop silently.
                    let _ = tx.send((handler_target.clone(), mapped));
                }
            })?;
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;
        Ok(Box::new(NotifyGuard { _watcher: watcher }))
    }
}

fn map_notify_event(
    target: &Path,
    parent: &Path,
    event: &notify::Event,
) -> Option<WatchEvent> {
    use notify::event::{EventKind, ModifyKind, RenameMode};

    let involves_target = event.paths.iter().any(|p| p == target);
    match &event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if event.paths.first().map(PathBuf::as_path) == Some(target) {
                event
                    .paths
                    .get(1)
                    .map(|to| WatchEvent::Renamed { to: to.clone() })
            } else {
                None
            }
        }
        // A lone "renamed from" with no destination reads as a removal.
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) if involves_target => {
            Some(WatchEvent::Removed)
        }
        EventKind::Modify(_) if involves_target => Some(WatchEvent::Modified),
        EventKind::Remove(_) => {
            if event.paths.iter().any(|p| p == parent) {
                Some(WatchEvent::RootRemoved)
            } else if involves_target {
                Some(WatchEvent::Removed)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Test watcher driven by hand: `fire` delivers an event to whoever watches
/// the path.
#[derive(Default)]
pub struct ManualWatcher {
    subscribers: Mutex<HashMap<PathBuf, Vec<(u64, WatchTx)>>>,
    next_id: Mutex<u64>,
}

impl ManualWatcher {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delivers `event` to every subscriber of `path`.
    pub fn fire(&self, path: &Path, event: WatchEvent) {
        let subscribers = self.subscribers.lock();
        if let Some(entries) = subscribers.get(path) {
            for (_, tx) in entries {
                let _ = tx.send((path.to_path_buf(), event.clone()));
            }
        }
    }

    /// Number of live subscriptions. Test hook.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscribers.lock().values().map(Vec::len).sum()
    }
}

struct ManualGuard {
    watcher: Arc<ManualWatcher>,
    path: PathBuf,
    id: u64,
}

impl WatchGuard for ManualGuard {}

impl Drop for ManualGuard {
    fn drop(&mut self) {
        let mut subscribers = self.watcher.subscribers.lock();
        if let Some(entries) = subscribers.get_mut(&self.path) {
            entries.retain(|(id, _)| *id != self.id);
            if entries.is_empty() {
                subscribers.remove(&self.path);
            }
        }
    }
}

impl PathWatcher for Arc<ManualWatcher> {
    fn watch(&self, path: &Path, tx: WatchTx) -> anyhow::Result<Box<dyn WatchGuard>> {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        self.subscribers
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .push((id, tx));
        Ok(Box::new(ManualGuard {
            watcher: Arc::clone(self),
            path: path.to_path_buf(),
            id,
        }))
    }
}
