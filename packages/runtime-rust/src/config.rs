//! Per-manager tunables with validating setters and change notifications.
//!
//! Each flavor manager owns one [`ManagerConfig`]. Setters validate their
//! inputs; changes that affect liveness (idle sweeping on/off, eviction
//! on/off) are published on a watch channel so the manager can start or
//! stop its periodic tasks.

use cachegrid_core::{CacheFlavor, TtlSpec};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::ValidationError;

/// Default cap on record count before count-based eviction kicks in.
pub const DEFAULT_MAX_RECORDS: u64 = 500;
/// Default idle threshold in milliseconds.
pub const DEFAULT_MAX_IDLE_MS: u64 = 60_000;
/// Default per-file size cap: 100 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
/// Default per-flavor in-memory budget: 1 GiB.
pub const DEFAULT_MAX_TOTAL_SIZE: u64 = 1024 * 1024 * 1024;

/// Ordering used by count-based eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionMode {
    /// Oldest `last_access || created` first.
    Lru,
    /// Smallest `touch + read` first.
    Lfu,
    /// Oldest `created` first.
    Fifo,
}

/// Count-based eviction tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionConfig {
    pub enabled: bool,
    /// Cap on live records. `None` disables count-based eviction entirely
    /// (the "unlimited" boundary).
    pub max_records: Option<u64>,
    pub mode: EvictionMode,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_records: Some(DEFAULT_MAX_RECORDS),
            mode: EvictionMode::Lru,
        }
    }
}

/// Idle-sweep tunables. Disabled by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleConfig {
    pub enabled: bool,
    pub max_idle_ms: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_idle_ms: DEFAULT_MAX_IDLE_MS,
        }
    }
}

/// Size caps. `max_file_size` only applies to the files flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeConfig {
    pub max_file_size: u64,
    pub max_total_size: u64,
}

impl Default for SizeConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_total_size: DEFAULT_MAX_TOTAL_SIZE,
        }
    }
}

/// Liveness-affecting change published to the owning manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChange {
    /// Initial watch value; nothing changed yet.
    Initial,
    IdleEnabled(bool),
    EvictionEnabled(bool),
}

/// The tunable set of one flavor manager.
pub struct ManagerConfig {
    flavor: CacheFlavor,
    ttl: RwLock<TtlSpec>,
    evict: RwLock<EvictionConfig>,
    idle: RwLock<IdleConfig>,
    size: RwLock<SizeConfig>,
    changes: watch::Sender<ConfigChange>,
}

impl ManagerConfig {
    /// Creates the default config for a flavor.
    #[must_use]
    pub fn new(flavor: CacheFlavor) -> Self {
        let (changes, _) = watch::channel(ConfigChange::Initial);
        Self {
            flavor,
            ttl: RwLock::new(TtlSpec::default()),
            evict: RwLock::new(EvictionConfig::default()),
            idle: RwLock::new(IdleConfig::default()),
            size: RwLock::new(SizeConfig::default()),
            changes,
        }
    }

    #[must_use]
    pub fn flavor(&self) -> CacheFlavor {
        self.flavor
    }

    /// Subscribes to liveness-affecting changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConfigChange> {
        self.changes.subscribe()
    }

    // --- Getters (copies; the structs are small) ---

    #[must_use]
    pub fn default_ttl(&self) -> TtlSpec {
        *self.ttl.read()
    }

    #[must_use]
    pub fn eviction(&self) -> EvictionConfig {
        *self.evict.read()
    }

    #[must_use]
    pub fn idle(&self) -> IdleConfig {
        *self.idle.read()
    }

    #[must_use]
    pub fn size(&self) -> SizeConfig {
        *self.size.read()
    }

    // --- Setters ---

    /// Sets the TTL applied to records that do not carry their own spec.
    pub fn set_default_ttl(&self, spec: TtlSpec) -> Result<(), ValidationError> {
        spec.validate_for(self.flavor)?;
        *self.ttl.write() = spec;
        Ok(())
    }

    /// Sets the record cap. `None` = unlimited; `Some(0)` is invalid.
    pub fn set_max_records(&self, max_records: Option<u64>) -> Result<(), ValidationError> {
        if max_records == Some(0) {
            return Err(ValidationError::ZeroTunable {
                field: "max_records",
            });
        }
        self.evict.write().max_records = max_records;
        Ok(())
    }

    pub fn set_eviction_mode(&self, mode: EvictionMode) {
        self.evict.write().mode = mode;
    }

    /// Enables or disables count-based eviction, notifying the manager.
    pub fn set_eviction_enabled(&self, enabled: bool) {
        let changed = {
            let mut evict = self.evict.write();
            let changed = evict.enabled != enabled;
            evict.enabled = enabled;
            changed
        };
        if changed {
            let _ = self.changes.send(ConfigChange::EvictionEnabled(enabled));
        }
    }

    /// Enables or disables the idle sweep, notifying the manager so it can
    /// start or stop the sweeper task.
    pub fn set_idle_enabled(&self, enabled: bool) {
        let changed = {
            let mut idle = self.idle.write();
            let changed = idle.enabled != enabled;
            idle.enabled = enabled;
            changed
        };
        if changed {
            let _ = self.changes.send(ConfigChange::IdleEnabled(enabled));
        }
    }

    pub fn set_max_idle(&self, max_idle_ms: u64) -> Result<(), ValidationError> {
        if max_idle_ms == 0 {
            return Err(ValidationError::ZeroTunable {
                field: "max_idle_ms",
            });
        }
        self.idle.write().max_idle_ms = max_idle_ms;
        Ok(())
    }

    pub fn set_max_file_size(&self, max_file_size: u64) -> Result<(), ValidationError> {
        if max_file_size == 0 {
            return Err(ValidationError::ZeroTunable {
                field: "max_file_size",
            });
        }
        self.size.write().max_file_size = max_file_size;
        Ok(())
    }

    pub fn set_max_total_size(&self, max_total_size: u64) -> Result<(), ValidationError> {
        if max_total_size == 0 {
            return Err(ValidationError::ZeroTunable {
                field: "max_total_size",
            });
        }
        self.size.write().max_total_size = max_total_size;
        Ok(())
    }
}
