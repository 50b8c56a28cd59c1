//! The cache root: owns engines, persistence, and both flavor managers.
//!
//! There are no global singletons; every cache instance is built explicitly
//! and carries a unique id, so multiple isolated caches can coexist in one
//! process.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::engine::{EngineProxy, EngineRegistry, StorageEngine};
use crate::error::ValidationError;
use crate::managers::{FileManager, KvManager};
use crate::persistence::drivers::LocalDiskDriver;
use crate::persistence::{DriverRegistry, PersistenceDriver, PersistenceProxy};
use crate::watch::{NotifyWatcher, PathWatcher};

use cachegrid_core::CacheFlavor;

/// Builder for a [`Cache`] instance.
#[derive(Default)]
pub struct CacheBuilder {
    engines: Vec<Arc<dyn StorageEngine>>,
    drivers: Vec<Arc<dyn PersistenceDriver>>,
    passphrase: Option<String>,
    watcher: Option<Arc<dyn PathWatcher>>,
    local_backup_base: Option<PathBuf>,
}

impl CacheBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a third-party storage engine (the memory engine is built in).
    #[must_use]
    pub fn with_engine(mut self, engine: Arc<dyn StorageEngine>) -> Self {
        self.engines.push(engine);
        self
    }

    /// Adds a persistence driver.
    #[must_use]
    pub fn with_driver(mut self, driver: Arc<dyn PersistenceDriver>) -> Self {
        self.drivers.push(driver);
        self
    }

    /// Registers the local-disk driver rooted at `base`.
    #[must_use]
    pub fn with_local_backups(mut self, base: impl Into<PathBuf>) -> Self {
        self.local_backup_base = Some(base.into());
        self
    }

    /// Encrypts backup streams with this passphrase.
    #[must_use]
    pub fn with_backup_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Replaces the default (`notify`-backed) filesystem watcher.
    #[must_use]
    pub fn with_watcher(mut self, watcher: Arc<dyn PathWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Wires the cache: registries, proxy, persistence, and both managers.
    pub fn build(self) -> Result<Cache, ValidationError> {
        let engines = Arc::new(EngineRegistry::with_memory());
        for engine in self.engines {
            engines.register(engine)?;
        }

        let drivers = Arc::new(DriverRegistry::new());
        if let Some(base) = self.local_backup_base {
            drivers.register(Arc::new(LocalDiskDriver::new(base)))?;
        }
        for driver in self.drivers {
            drivers.register(driver)?;
        }

        let proxy = Arc::new(EngineProxy::new(Arc::clone(&engines)));
        let persistence = Arc::new(PersistenceProxy::new(
            Arc::clone(&drivers),
            self.passphrase,
        ));
        let watcher = self
            .watcher
            .unwrap_or_else(|| Arc::new(NotifyWatcher) as Arc<dyn PathWatcher>);

        let kvs = KvManager::new(
            Arc::clone(&proxy),
            Arc::clone(&persistence),
            Arc::new(ManagerConfig::new(CacheFlavor::Kvs)),
        );
        let files = FileManager::new(
            proxy,
            persistence,
            Arc::new(ManagerConfig::new(CacheFlavor::Files)),
            watcher,
        );

        Ok(Cache {
            id: Uuid::new_v4().to_string(),
            engines,
            drivers,
            kvs,
            files,
            state: ArcSwap::from_pointee(CacheState::Ready),
        })
    }
}

/// Lifecycle state of a cache instance.
///
/// State machine: Ready -> TornDown (one-way).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Fully operational.
    Ready,
    /// Torn down: sessions released, jobs cancelled, buses disposed.
    TornDown,
}

/// One isolated cache instance.
pub struct Cache {
    id: String,
    engines: Arc<EngineRegistry>,
    drivers: Arc<DriverRegistry>,
    kvs: KvManager,
    files: FileManager,
    state: ArcSwap<CacheState>,
}

impl Cache {
    #[must_use]
    pub fn builder() -> CacheBuilder {
        CacheBuilder::new()
    }

    /// Unique id of this instance.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kvs(&self) -> &KvManager {
        &self.kvs
    }

    #[must_use]
    pub fn files(&self) -> &FileManager {
        &self.files
    }

    #[must_use]
    pub fn engines(&self) -> &Arc<EngineRegistry> {
        &self.engines
    }

    #[must_use]
    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    #[must_use]
    pub fn state(&self) -> CacheState {
        **self.state.load()
    }

    /// Tears both flavors down: sessions released, jobs and sweepers
    /// cancelled, buses disposed. Idempotent.
    pub fn teardown(&self) {
        if self.state() == CacheState::TornDown {
            return;
        }
        self.state.store(Arc::new(CacheState::TornDown));
        self.kvs.teardown();
        self.files.teardown();
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use cachegrid_core::Value;

    use super::*;
    use crate::managers::file::{FileReadOptions, FileSetOptions};
    use crate::managers::{ReadOptions, SetOptions};
    use crate::persistence::drivers::MemoryDriver;
    use crate::watch::ManualWatcher;

    fn cache() -> Cache {
        Cache::builder()
            .with_driver(Arc::new(MemoryDriver::new()))
            .with_watcher(Arc::new(ManualWatcher::new()) as Arc<dyn PathWatcher>)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn instances_are_isolated_with_unique_ids() {
        let a = cache();
        let b = cache();
        assert_ne!(a.id(), b.id());

        a.kvs()
            .set("k", Value::string("a-only"), SetOptions::default())
            .await
            .unwrap();
        assert!(!b.kvs().has("k", None));
    }

    #[tokio::test]
    async fn both_flavors_are_usable() {
        let cache = cache();
        cache
            .kvs()
            .set("k", Value::string("v"), SetOptions::default())
            .await
            .unwrap();
        assert_eq!(cache.kvs().size(), 1);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"content").unwrap();
        cache
            .files()
            .set(&path, FileSetOptions::default())
            .await
            .unwrap();
        assert_eq!(cache.files().size(), 1);
        let bytes = cache
            .files()
            .read(FileReadOptions::path(&path))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bytes.as_ref(), b"content");
    }

    #[tokio::test]
    async fn full_backup_round_trip_across_both_flavors() {
        let cache = cache();
        cache.kvs().config().set_max_records(None).unwrap();

        for i in 0..1_000 {
            cache
                .kvs()
                .set(
                    &format!("k{i}"),
                    Value::Json(serde_json::json!(i)),
                    SetOptions::default(),
                )
                .await
                .unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        let mut file_paths = Vec::new();
        for i in 0..10 {
            let path = dir.path().join(format!("f{i}.txt"));
            std::fs::write(&path, format!("file {i}")).unwrap();
            cache
                .files()
                .set(&path, FileSetOptions::default())
                .await
                .unwrap();
            file_paths.push(path);
        }

        assert_eq!(cache.kvs().backup("mem", "snap").await.unwrap(), 1_000);
        assert_eq!(cache.files().backup("mem", "snap").await.unwrap(), 10);

        cache.kvs().clear(None).await.unwrap();
        cache.files().clear(None).await.unwrap();
        assert_eq!(cache.kvs().size(), 0);
        assert_eq!(cache.files().size(), 0);

        assert_eq!(cache.kvs().restore("mem", "snap").await.unwrap(), 1_000);
        assert_eq!(cache.files().restore("mem", "snap").await.unwrap(), 10);

        assert_eq!(cache.kvs().size(), 1_000);
        assert_eq!(cache.files().size(), 10);
        assert_eq!(
            cache
                .kvs()
                .read("k500", ReadOptions::default())
                .await
                .unwrap(),
            Some(Value::Json(serde_json::json!(500)))
        );
        let bytes = cache
            .files()
            .read(FileReadOptions::path(&file_paths[3]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bytes.as_ref(), b"file 3");
    }

    #[tokio::test]
    async fn encrypted_cache_round_trips_backups() {
        let cache = Cache::builder()
            .with_driver(Arc::new(MemoryDriver::new()))
            .with_watcher(Arc::new(ManualWatcher::new()) as Arc<dyn PathWatcher>)
            .with_backup_passphrase("s3cret")
            .build()
            .unwrap();

        cache
            .kvs()
            .set("k", Value::string("confidential"), SetOptions::default())
            .await
            .unwrap();
        cache.kvs().backup("mem", "snap").await.unwrap();
        cache.kvs().clear(None).await.unwrap();
        cache.kvs().restore("mem", "snap").await.unwrap();

        assert_eq!(
            cache.kvs().read("k", ReadOptions::default()).await.unwrap(),
            Some(Value::string("confidential"))
        );
    }

    #[tokio::test]
    async fn local_disk_backups_use_the_documented_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::builder()
            .with_local_backups(dir.path())
            .with_watcher(Arc::new(ManualWatcher::new()) as Arc<dyn PathWatcher>)
            .build()
            .unwrap();

        cache
            .kvs()
            .set("k", Value::string("v"), SetOptions::default())
            .await
            .unwrap();
        cache.kvs().backup("local", "nightly").await.unwrap();
        assert!(dir
            .path()
            .join("cachegrid")
            .join("backups")
            .join("kvs-nightly.backup")
            .exists());

        // Traversal names are rejected before any write.
        assert!(cache.kvs().backup("local", "../escape").await.is_err());
    }

    #[tokio::test]
    async fn teardown_disposes_both_flavors() {
        let cache = cache();
        assert_eq!(cache.state(), CacheState::Ready);

        cache.teardown();
        assert_eq!(cache.state(), CacheState::TornDown);
        assert!(cache.kvs().events().is_disposed());
        assert!(cache.files().events().is_disposed());

        // Idempotent.
        cache.teardown();
        assert_eq!(cache.state(), CacheState::TornDown);
    }
}
