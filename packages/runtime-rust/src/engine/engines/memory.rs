//! In-memory [`StorageEngine`] backed by [`DashMap`].
//!
//! Storage layout follows the canonical three levels: flavor, then scope,
//! then key. Concurrent read/write access needs no external locking.

use async_trait::async_trait;
use cachegrid_core::{CacheFlavor, RecordDescriptor, Value, MEMORY_ENGINE};
use dashmap::DashMap;

use crate::engine::StorageEngine;

type ScopeMap = DashMap<String, DashMap<String, Value>>;

/// The always-present in-memory engine, reserved under the name `memory`.
pub struct MemoryEngine {
    kvs: ScopeMap,
    files: ScopeMap,
}

impl MemoryEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            kvs: ScopeMap::new(),
            files: ScopeMap::new(),
        }
    }

    fn flavor_map(&self, flavor: CacheFlavor) -> &ScopeMap {
        match flavor {
            CacheFlavor::Kvs => &self.kvs,
            CacheFlavor::Files => &self.files,
        }
    }

    /// Number of values stored for a flavor, across all scopes. Test hook.
    #[must_use]
    pub fn len(&self, flavor: CacheFlavor) -> usize {
        self.flavor_map(flavor)
            .iter()
            .map(|scope| scope.value().len())
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self, flavor: CacheFlavor) -> bool {
        self.len(flavor) == 0
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    fn name(&self) -> &str {
        MEMORY_ENGINE
    }

    async fn set(&self, descriptor: &RecordDescriptor, value: Value) -> anyhow::Result<()> {
        self.flavor_map(descriptor.flavor)
            .entry(descriptor.scope.clone())
            .or_default()
            .insert(descriptor.key.clone(), value);
        Ok(())
    }

    async fn read(&self, descriptor: &RecordDescriptor) -> anyhow::Result<Option<Value>> {
        Ok(self
            .flavor_map(descriptor.flavor)
            .get(&descriptor.scope)
            .and_then(|scope| scope.get(&descriptor.key).map(|v| v.clone())))
    }

    async fn remove(&self, descriptor: &RecordDescriptor) -> anyhow::Result<bool> {
        let map = self.flavor_map(descriptor.flavor);
        let existed = map
            .get(&descriptor.scope)
            .is_some_and(|scope| scope.remove(&descriptor.key).is_some());
        // Drop scope maps that emptied out so scopes do not accumulate.
        map.remove_if(&descriptor.scope, |_, scope| scope.is_empty());
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(flavor: CacheFlavor, scope: &str, key: &str) -> RecordDescriptor {
        RecordDescriptor::new(flavor, scope, key)
    }

    #[tokio::test]
    async fn set_read_remove_round_trip() {
        let engine = MemoryEngine::new();
        let d = desc(CacheFlavor::Kvs, "global", "a");

        engine.set(&d, Value::string("1")).await.unwrap();
        assert_eq!(engine.read(&d).await.unwrap(), Some(Value::string("1")));

        assert!(engine.remove(&d).await.unwrap());
        assert_eq!(engine.read(&d).await.unwrap(), None);
        assert!(!engine.remove(&d).await.unwrap());
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let engine = MemoryEngine::new();
        let a = desc(CacheFlavor::Kvs, "tenant-a", "k");
        let b = desc(CacheFlavor::Kvs, "tenant-b", "k");

        engine.set(&a, Value::string("va")).await.unwrap();
        engine.set(&b, Value::string("vb")).await.unwrap();

        assert_eq!(engine.read(&a).await.unwrap(), Some(Value::string("va")));
        assert_eq!(engine.read(&b).await.unwrap(), Some(Value::string("vb")));

        engine.remove(&a).await.unwrap();
        assert_eq!(engine.read(&a).await.unwrap(), None);
        assert_eq!(engine.read(&b).await.unwrap(), Some(Value::string("vb")));
    }

    #[tokio::test]
    async fn flavors_are_isolated() {
        let engine = MemoryEngine::new();
        let kv = desc(CacheFlavor::Kvs, "global", "same-key");
        let file = desc(CacheFlavor::Files, "global", "same-key");

        engine.set(&kv, Value::string("kv")).await.unwrap();
        assert_eq!(engine.read(&file).await.unwrap(), None);
        assert_eq!(engine.len(CacheFlavor::Kvs), 1);
        assert_eq!(engine.len(CacheFlavor::Files), 0);
    }

    #[tokio::test]
    async fn set_replaces_existing_value() {
        let engine = MemoryEngine::new();
        let d = desc(CacheFlavor::Kvs, "global", "k");

        engine.set(&d, Value::string("old")).await.unwrap();
        engine.set(&d, Value::string("new")).await.unwrap();
        assert_eq!(engine.read(&d).await.unwrap(), Some(Value::string("new")));
        assert_eq!(engine.len(CacheFlavor::Kvs), 1);
    }

    #[tokio::test]
    async fn empty_scopes_are_cleaned_up() {
        let engine = MemoryEngine::new();
        let d = desc(CacheFlavor::Kvs, "tenant", "k");

        engine.set(&d, Value::string("v")).await.unwrap();
        engine.remove(&d).await.unwrap();
        assert!(engine.kvs.get("tenant").is_none());
    }
}
