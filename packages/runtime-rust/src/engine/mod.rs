//! Storage engine trait, registry, and the fan-out proxy.
//!
//! An engine is the innermost storage layer: three async operations keyed by
//! a [`RecordDescriptor`]. The built-in [`MemoryEngine`](engines::MemoryEngine)
//! is always registered under the reserved name `memory`; remote engines
//! (Redis, S3, ...) implement the same trait out of tree and project the
//! `(flavor, scope, key)` tuple into their native keyspace.

pub mod engines;
pub mod proxy;

use std::sync::Arc;

use async_trait::async_trait;
use cachegrid_core::{RecordDescriptor, Value, MEMORY_ENGINE};
use dashmap::DashMap;

use crate::error::ValidationError;

pub use proxy::{EngineProxy, ReadOutcome};

/// Scoped storage of opaque values keyed by `(flavor, scope, key)`.
///
/// `read` distinguishes "absent" (`Ok(None)`) from "failed" (`Err`); the
/// proxy's availability semantics depend on that distinction. Implementations
/// are used as `Arc<dyn StorageEngine>`.
#[async_trait]
pub trait StorageEngine: Send + Sync + 'static {
    /// Unique engine name. `memory` is reserved for the built-in engine.
    fn name(&self) -> &str;

    /// Stores a value, replacing any previous one.
    async fn set(&self, descriptor: &RecordDescriptor, value: Value) -> anyhow::Result<()>;

    /// Reads a value. `Ok(None)` means the engine definitely does not hold
    /// the record; `Err` means the engine could not answer.
    async fn read(&self, descriptor: &RecordDescriptor) -> anyhow::Result<Option<Value>>;

    /// Removes a value, returning whether one existed.
    async fn remove(&self, descriptor: &RecordDescriptor) -> anyhow::Result<bool>;
}

/// Name-keyed set of registered engines.
///
/// The memory engine is registered at construction; third-party engines are
/// added via [`register`](EngineRegistry::register) before records name them.
pub struct EngineRegistry {
    engines: DashMap<String, Arc<dyn StorageEngine>>,
}

impl EngineRegistry {
    /// Creates a registry holding the built-in memory engine.
    #[must_use]
    pub fn with_memory() -> Self {
        let registry = Self {
            engines: DashMap::new(),
        };
        registry.engines.insert(
            MEMORY_ENGINE.to_string(),
            Arc::new(engines::MemoryEngine::new()) as Arc<dyn StorageEngine>,
        );
        registry
    }

    /// Registers a third-party engine under its own name.
    pub fn register(&self, engine: Arc<dyn StorageEngine>) -> Result<(), ValidationError> {
        let name = engine.name().to_string();
        if name == MEMORY_ENGINE {
            return Err(ValidationError::ReservedEngineName { name });
        }
        match self.engines.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ValidationError::DuplicateEngine { name })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(engine);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn StorageEngine>> {
        self.engines.get(name).map(|entry| Arc::clone(&entry))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.engines.contains_key(name)
    }

    /// Registered engine names, unordered.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.key().clone()).collect()
    }

    /// Checks that a record's engine list is non-empty and fully resolvable.
    pub fn check_known(&self, names: &[String]) -> Result<(), ValidationError> {
        if names.is_empty() {
            return Err(ValidationError::NoEngines);
        }
        for name in names {
            if !self.contains(name) {
                return Err(ValidationError::UnknownEngine {
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use cachegrid_core::CacheFlavor;

    use super::*;

    struct DummyEngine {
        name: &'static str,
    }

    #[async_trait]
    impl StorageEngine for DummyEngine {
        fn name(&self) -> &str {
            self.name
        }
        async fn set(&self, _: &RecordDescriptor, _: Value) -> anyhow::Result<()> {
            Ok(())
        }
        async fn read(&self, _: &RecordDescriptor) -> anyhow::Result<Option<Value>> {
            Ok(None)
        }
        async fn remove(&self, _: &RecordDescriptor) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn memory_engine_is_always_present() {
        let registry = EngineRegistry::with_memory();
        assert!(registry.contains(MEMORY_ENGINE));
        assert!(registry.get(MEMORY_ENGINE).is_some());
    }

    #[test]
    fn register_rejects_the_reserved_name() {
        let registry = EngineRegistry::with_memory();
        let err = registry
            .register(Arc::new(DummyEngine { name: "memory" }))
            .unwrap_err();
        assert!(matches!(err, ValidationError::ReservedEngineName { .. }));
    }

    #[test]
    fn register_rejects_duplicates() {
        let registry = EngineRegistry::with_memory();
        registry
            .register(Arc::new(DummyEngine { name: "redis" }))
            .unwrap();
        let err = registry
            .register(Arc::new(DummyEngine { name: "redis" }))
            .unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateEngine { .. }));
    }

    #[test]
    fn check_known_validates_the_engine_list() {
        let registry = EngineRegistry::with_memory();
        registry
            .register(Arc::new(DummyEngine { name: "disk" }))
            .unwrap();

        assert!(registry
            .check_known(&["memory".to_string(), "disk".to_string()])
            .is_ok());
        assert!(matches!(
            registry.check_known(&[]),
            Err(ValidationError::NoEngines)
        ));
        assert!(matches!(
            registry.check_known(&["s3".to_string()]),
            Err(ValidationError::UnknownEngine { .. })
        ));
    }

    #[tokio::test]
    async fn registered_engine_is_usable_through_the_registry() {
        let registry = EngineRegistry::with_memory();
        let engine = registry.get(MEMORY_ENGINE).unwrap();
        let desc = RecordDescriptor::new(CacheFlavor::Kvs, "global", "k");
        engine.set(&desc, Value::string("v")).await.unwrap();
        assert_eq!(
            engine.read(&desc).await.unwrap(),
            Some(Value::string("v"))
        );
    }
}
