//! In-memory persistence driver.
//!
//! Holds backups as byte buffers keyed by `(flavor, name)`. The default
//! medium for tests and for embedders that snapshot/restore within one
//! process.

use std::collections::HashMap;

use async_trait::async_trait;
use cachegrid_core::CacheFlavor;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use crate::persistence::{ByteSource, PersistenceDriver};

/// Driver persisting backups into process memory.
#[derive(Default)]
pub struct MemoryDriver {
    slots: Mutex<HashMap<(CacheFlavor, String), Vec<u8>>>,
}

impl MemoryDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored backups. Test hook.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

#[async_trait]
impl PersistenceDriver for MemoryDriver {
    fn name(&self) -> &str {
        "mem"
    }

    async fn backup(
        &self,
        flavor: CacheFlavor,
        mut stream: ByteSource,
        name: &str,
    ) -> anyhow::Result<()> {
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await?;
        self.slots
            .lock()
            .insert((flavor, name.to_string()), bytes);
        Ok(())
    }

    async fn restore(&self, flavor: CacheFlavor, name: &str) -> anyhow::Result<ByteSource> {
        let bytes = self
            .slots
            .lock()
            .get(&(flavor, name.to_string()))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no {flavor} backup named {name}"))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }
}
