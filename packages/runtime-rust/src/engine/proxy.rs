//! Engine fan-out proxy: parallel writes with compensation, first-wins
//! reads, best-effort removes, and per-key waiter coalescing.
//!
//! Failure semantics:
//! - `set` is fail-closed: any engine failure compensates the successful
//!   engines and surfaces an aggregate error, so a record is never half
//!   written.
//! - `remove` is best-effort: it succeeds if at least one engine cleared
//!   the record and fails only when every engine failed.
//! - `read` is read-your-write for memory (tried first, short-circuits) and
//!   availability-biased otherwise: remaining engines race, first defined
//!   value wins, and an aggregate error is raised only when every engine
//!   failed without one reporting "absent".
//!
//! Concurrent identical reads/removes on the same key join the in-flight
//! task instead of fanning out again; operations on the same key are
//! serialized, with queued reads overtaking queued removes.

use std::sync::Arc;

use cachegrid_core::{RecordDescriptor, Value, MEMORY_ENGINE};
use futures_util::stream::{FuturesUnordered, StreamExt};

use crate::engine::{EngineRegistry, StorageEngine};
use crate::error::{EngineError, EngineFailure};
use crate::tasks::{KeyGates, OpClass, SharedFlights};

/// Result of a proxy read.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// A value, plus the name of the engine that served it.
    Found { source: String, value: Value },
    /// Every engine answered and none holds the record.
    Absent,
}

impl ReadOutcome {
    /// Engine that produced this outcome; the sentinel source is the proxy
    /// itself when every engine reported absent.
    #[must_use]
    pub fn source(&self) -> &str {
        match self {
            Self::Found { source, .. } => source,
            Self::Absent => "proxy",
        }
    }

    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Found { value, .. } => Some(value),
            Self::Absent => None,
        }
    }
}

type ReadResult = Result<ReadOutcome, Arc<EngineError>>;
type RemoveResult = Result<bool, Arc<EngineError>>;

/// Fan-out proxy over the registered engines.
pub struct EngineProxy {
    registry: Arc<EngineRegistry>,
    gates: Arc<KeyGates<RecordDescriptor>>,
    read_flights: SharedFlights<RecordDescriptor, ReadResult>,
    remove_flights: SharedFlights<RecordDescriptor, RemoveResult>,
}

impl EngineProxy {
    #[must_use]
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        Self {
            registry,
            gates: Arc::new(KeyGates::default()),
            read_flights: SharedFlights::default(),
            remove_flights: SharedFlights::default(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    /// Writes `value` to every engine in `engines`, atomically.
    pub async fn set(
        &self,
        descriptor: &RecordDescriptor,
        engines: &[String],
        value: Value,
    ) -> Result<(), Arc<EngineError>> {
        let _gate = self
            .gates
            .acquire(descriptor.clone(), OpClass::Write)
            .await;

        let mut causes = Vec::new();
        let mut resolved = Vec::new();
        for name in engines {
            match self.registry.get(name) {
                Some(engine) => resolved.push((name.clone(), engine)),
                None => causes.push(EngineFailure {
                    engine: name.clone(),
                    source: anyhow::anyhow!("engine not registered"),
                }),
            }
        }

        let attempts = resolved.iter().map(|(name, engine)| {
            let value = value.clone();
            async move { (name.clone(), Arc::clone(engine), engine.set(descriptor, value).await) }
        });
        let results = futures_util::future::join_all(attempts).await;

        let mut succeeded = Vec::new();
        for (name, engine, result) in results {
            match result {
                Ok(()) => succeeded.push((name, engine)),
                Err(source) => causes.push(EngineFailure {
                    engine: name,
                    source,
                }),
            }
        }

        if causes.is_empty() {
            return Ok(());
        }

        // Compensate: undo the successful writes so the record is not half
        // present across engines.
        for (name, engine) in succeeded {
            if let Err(error) = engine.remove(descriptor).await {
                tracing::warn!(
                    engine = %name,
                    descriptor = %descriptor,
                    %error,
                    "compensating remove failed after partial set"
                );
            }
        }
        Err(Arc::new(EngineError::WriteFailed {
            descriptor: descriptor.to_string(),
            total: engines.len(),
            causes,
        }))
    }

    /// Reads the record, memory engine first, remaining engines raced.
    pub async fn read(
        &self,
        descriptor: &RecordDescriptor,
        engines: &[String],
    ) -> Result<ReadOutcome, Arc<EngineError>> {
        let registry = Arc::clone(&self.registry);
        let gates = Arc::clone(&self.gates);
        let desc = descriptor.clone();
        let names = engines.to_vec();
        self.read_flights
            .run(descriptor.clone(), move || async move {
                let _gate = gates.acquire(desc.clone(), OpClass::Read).await;
                read_fan_out(&registry, &desc, &names)
                    .await
                    .map_err(Arc::new)
            })
            .await
    }

    /// Removes the record from every engine, best-effort.
    ///
    /// Returns whether any engine actually held the record.
    pub async fn remove(
        &self,
        descriptor: &RecordDescriptor,
        engines: &[String],
    ) -> Result<bool, Arc<EngineError>> {
        let registry = Arc::clone(&self.registry);
        let gates = Arc::clone(&self.gates);
        let desc = descriptor.clone();
        let names = engines.to_vec();
        self.remove_flights
            .run(descriptor.clone(), move || async move {
                let _gate = gates.acquire(desc.clone(), OpClass::Write).await;
                remove_fan_out(&registry, &desc, &names)
                    .await
                    .map_err(Arc::new)
            })
            .await
    }

    /// Removes the record from a single engine, serialized with the other
    /// operations on its key. Used to drop memory-resident file content
    /// while the record keeps living in its other engines.
    pub async fn remove_from(
        &self,
        descriptor: &RecordDescriptor,
        engine_name: &str,
    ) -> Result<bool, Arc<EngineError>> {
        let _gate = self
            .gates
            .acquire(descriptor.clone(), OpClass::Write)
            .await;
        let Some(engine) = self.registry.get(engine_name) else {
            return Err(Arc::new(EngineError::RemoveFailed {
                descriptor: descriptor.to_string(),
                causes: vec![EngineFailure {
                    engine: engine_name.to_string(),
                    source: anyhow::anyhow!("engine not registered"),
                }],
            }));
        };
        engine.remove(descriptor).await.map_err(|source| {
            Arc::new(EngineError::RemoveFailed {
                descriptor: descriptor.to_string(),
                causes: vec![EngineFailure {
                    engine: engine_name.to_string(),
                    source,
                }],
            })
        })
    }
}

async fn read_fan_out(
    registry: &EngineRegistry,
    descriptor: &RecordDescriptor,
    names: &[String],
) -> Result<ReadOutcome, EngineError> {
    let mut causes = Vec::new();
    let mut answered_absent = 0_usize;
    let mut memory: Option<Arc<dyn StorageEngine>> = None;
    let mut rest = Vec::new();

    for name in names {
        match registry.get(name) {
            Some(engine) if name == MEMORY_ENGINE => memory = Some(engine),
            Some(engine) => rest.push((name.clone(), engine)),
            None => causes.push(EngineFailure {
                engine: name.clone(),
                source: anyhow::anyhow!("engine not registered"),
            }),
        }
    }

    // Memory is authoritative for its own writes; a defined value
    // short-circuits the fan-out.
    if let Some(engine) = memory {
        match engine.read(descriptor).await {
            Ok(Some(value)) => {
                return Ok(ReadOutcome::Found {
                    source: MEMORY_ENGINE.to_string(),
                    value,
                })
            }
            Ok(None) => answered_absent += 1,
            Err(source) => causes.push(EngineFailure {
                engine: MEMORY_ENGINE.to_string(),
                source,
            }),
        }
    }

    let mut pending: FuturesUnordered<_> = rest
        .into_iter()
        .map(|(name, engine)| async move {
            let result = engine.read(descriptor).await;
            (name, result)
        })
        .collect();

    while let Some((name, result)) = pending.next().await {
        match result {
            // First defined value wins; later engines are abandoned.
            Ok(Some(value)) => return Ok(ReadOutcome::Found { source: name, value }),
            Ok(None) => answered_absent += 1,
            Err(source) => causes.push(EngineFailure {
                engine: name,
                source,
            }),
        }
    }

    if answered_absent > 0 {
        Ok(ReadOutcome::Absent)
    } else {
        Err(EngineError::ReadFailed {
            descriptor: descriptor.to_string(),
            causes,
        })
    }
}

async fn remove_fan_out(
    registry: &EngineRegistry,
    descriptor: &RecordDescriptor,
    names: &[String],
) -> Result<bool, EngineError> {
    let mut causes = Vec::new();
    let mut resolved = Vec::new();
    for name in names {
        match registry.get(name) {
            Some(engine) => resolved.push((name.clone(), engine)),
            None => causes.push(EngineFailure {
                engine: name.clone(),
                source: anyhow::anyhow!("engine not registered"),
            }),
        }
    }

    let attempts = resolved.into_iter().map(|(name, engine)| async move {
        let result = engine.remove(descriptor).await;
        (name, result)
    });
    let results = futures_util::future::join_all(attempts).await;

    let mut any_succeeded = false;
    let mut existed = false;
    for (name, result) in results {
        match result {
            Ok(removed) => {
                any_succeeded = true;
                existed |= removed;
            }
            Err(source) => causes.push(EngineFailure {
                engine: name,
                source,
            }),
        }
    }

    if any_succeeded {
        Ok(existed)
    } else {
        Err(EngineError::RemoveFailed {
            descriptor: descriptor.to_string(),
            causes,
        })
    }
}
