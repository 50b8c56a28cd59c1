//! Flavor manager fronts.
//!
//! A manager owns its flavor's scope map, event bus, eviction scheduling,
//! memory accounting, and the backup/restore entry points. All map
//! mutation happens in the manager's own `remove`/`bulkRemove` handlers
//! (registered `BeforeAll`), which keeps the detach ordering: engines
//! first, then the scope map.

pub mod file;
pub mod kv;

use cachegrid_core::TtlSpec;
use parking_lot::Mutex;

use crate::error::StateError;

pub use file::{FileManager, FileReadOptions, FileSetOptions};
pub use kv::KvManager;

/// Max restore tasks materializing records at once.
pub(crate) const RESTORE_CONCURRENCY: usize = 8;

/// Options of a KV `set`.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Target scope; defaults to `global`.
    pub scope: Option<String>,
    /// Per-record TTL; defaults to the manager's configured TTL.
    pub ttl: Option<TtlSpec>,
    /// Engines to store in; defaults to `["memory"]`.
    pub store_in: Option<Vec<String>>,
}

/// Options of a KV `read`.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub scope: Option<String>,
}

/// The mutually exclusive long-running manager processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Clearing,
    BackingUp,
    Restoring,
}

impl Activity {
    fn label(self) -> &'static str {
        match self {
            Self::Clearing => "clearing",
            Self::BackingUp => "backing up",
            Self::Restoring => "restoring",
        }
    }
}

/// Blocking flag set: at most one of `{clearing, backingUp, restoring}` is
/// active; reads and writes are rejected while clearing.
#[derive(Debug, Default)]
pub struct BlockingFlags {
    active: Mutex<Option<Activity>>,
}

impl BlockingFlags {
    /// Claims the flag for `activity`; fails while a different process runs.
    pub fn begin(&self, activity: Activity) -> Result<FlagGuard<'_>, StateError> {
        let mut active = self.active.lock();
        if let Some(current) = *active {
            return Err(StateError::Busy {
                active: current.label(),
                requested: activity.label(),
            });
        }
        *active = Some(activity);
        Ok(FlagGuard { flags: self })
    }

    /// Rejects reads/writes while a clear is running.
    pub fn check_operational(&self) -> Result<(), StateError> {
        match *self.active.lock() {
            Some(Activity::Clearing) => Err(StateError::Clearing),
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn active(&self) -> Option<Activity> {
        *self.active.lock()
    }
}

/// RAII token of an active flag; clears on drop.
#[derive(Debug)]
pub struct FlagGuard<'a> {
    flags: &'a BlockingFlags,
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        *self.flags.active.lock() = None;
    }
}
