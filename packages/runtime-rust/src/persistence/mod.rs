//! Persistence drivers and the proxy routing managers to them.
//!
//! A driver moves backup bytes to and from its medium; the manager owns the
//! record iteration and the stream framing. The proxy validates the target
//! (supported flavor, registered driver) and runs the driver and the
//! producer concurrently over an in-process duplex pipe, so backpressure
//! flows from the driver's medium back into record export.

pub mod drivers;

use std::sync::Arc;

use async_trait::async_trait;
use cachegrid_core::CacheFlavor;
use dashmap::DashMap;
use tokio::io::AsyncRead;

use crate::backup::{BackupStream, RestoreStream};
use crate::error::{CacheError, ValidationError};

/// Buffer of the in-process pipe between producer and driver.
const DUPLEX_BUFFER: usize = 64 * 1024;

/// Byte source handed back by a driver's restore.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Moves backup streams to and from a storage medium.
///
/// Implementations are registered by name; the local-disk driver ships with
/// the runtime, remote media (S3 and friends) implement this out of tree.
#[async_trait]
pub trait PersistenceDriver: Send + Sync + 'static {
    /// Unique driver name.
    fn name(&self) -> &str;

    /// Consumes `stream` (the framed backup bytes) and persists it under
    /// `name` for the given flavor.
    async fn backup(
        &self,
        flavor: CacheFlavor,
        stream: ByteSource,
        name: &str,
    ) -> anyhow::Result<()>;

    /// Produces the byte stream of a previously persisted backup.
    async fn restore(&self, flavor: CacheFlavor, name: &str) -> anyhow::Result<ByteSource>;
}

/// Name-keyed set of registered drivers.
pub struct DriverRegistry {
    drivers: DashMap<String, Arc<dyn PersistenceDriver>>,
}

impl DriverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            drivers: DashMap::new(),
        }
    }

    pub fn register(&self, driver: Arc<dyn PersistenceDriver>) -> Result<(), ValidationError> {
        let name = driver.name().to_string();
        match self.drivers.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ValidationError::DuplicateDriver { name })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(driver);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn PersistenceDriver>> {
        self.drivers.get(name).map(|entry| Arc::clone(&entry))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains_key(name)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Flavor-agnostic routing from managers to a driver.
pub struct PersistenceProxy {
    drivers: Arc<DriverRegistry>,
    passphrase: Option<String>,
}

impl PersistenceProxy {
    #[must_use]
    pub fn new(drivers: Arc<DriverRegistry>, passphrase: Option<String>) -> Self {
        Self {
            drivers,
            passphrase,
        }
    }

    #[must_use]
    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    fn require_driver(&self, name: &str) -> Result<Arc<dyn PersistenceDriver>, ValidationError> {
        self.drivers
            .get(name)
            .ok_or_else(|| ValidationError::UnknownDriver {
                name: name.to_string(),
            })
    }

    /// Runs a backup: `produce` writes records into the framed stream while
    /// the named driver drains the bytes, concurrently.
    ///
    /// Returns the number of records written.
    pub async fn backup_with<F, Fut>(
        &self,
        flavor: CacheFlavor,
        to: &str,
        name: &str,
        produce: F,
    ) -> Result<u64, CacheError>
    where
        F: FnOnce(BackupStream<tokio::io::DuplexStream>) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<u64>>,
    {
        let driver = self.require_driver(to)?;
        let (writer, reader) = tokio::io::duplex(DUPLEX_BUFFER);
        let stream = BackupStream::open(writer, self.passphrase.as_deref())
            .await
            .map_err(CacheError::Stream)?;

        let driver_task = driver.backup(flavor, Box::new(reader), name);
        let producer_task = produce(stream);
        let (driver_result, produced) = tokio::join!(driver_task, producer_task);

        driver_result.map_err(CacheError::Stream)?;
        produced.map_err(CacheError::Stream)
    }

    /// Opens a restore stream from the named driver.
    pub async fn restore_from(
        &self,
        flavor: CacheFlavor,
        from: &str,
        name: &str,
    ) -> Result<RestoreStream<ByteSource>, CacheError> {
        let driver = self.require_driver(from)?;
        let source = driver
            .restore(flavor, name)
            .await
            .map_err(CacheError::Stream)?;
        RestoreStream::open(source, self.passphrase.as_deref())
            .await
            .map_err(CacheError::Stream)
    }
}
