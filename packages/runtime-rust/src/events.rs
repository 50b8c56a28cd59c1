//! Per-flavor event bus with phased, ordered, awaited dispatch.
//!
//! Handlers register for one [`EventKind`] (or the wildcard) in one of three
//! phases. Emission awaits every handler sequentially: all `BeforeAll`
//! handlers complete before the first `Normal` handler runs, and so on.
//! Within a phase, kind-specific handlers run before wildcard handlers,
//! each in registration order.
//!
//! The `remove` event at `BeforeAll` is the cascade hook managers use for
//! engine cleanup and map detachment, which is why the ordering guarantee
//! matters.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cachegrid_core::{CacheFlavor, EventKind, EventPayload};
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;

/// Dispatch phase of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    BeforeAll,
    Normal,
    AfterAll,
}

const PHASES: [Phase; 3] = [Phase::BeforeAll, Phase::Normal, Phase::AfterAll];

impl Phase {
    fn index(self) -> usize {
        match self {
            Self::BeforeAll => 0,
            Self::Normal => 1,
            Self::AfterAll => 2,
        }
    }
}

/// An async event handler. Build one with [`EventBus::handler`].
pub type EventHandler = Arc<dyn Fn(Arc<EventPayload>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct PhaseRegistry {
    specific: HashMap<EventKind, Vec<EventHandler>>,
    any: Vec<EventHandler>,
}

/// Typed, ordered event bus for one flavor.
pub struct EventBus {
    flavor: CacheFlavor,
    phases: RwLock<[PhaseRegistry; 3]>,
    disposed: AtomicBool,
}

impl EventBus {
    #[must_use]
    pub fn new(flavor: CacheFlavor) -> Self {
        Self {
            flavor,
            phases: RwLock::new([
                PhaseRegistry::default(),
                PhaseRegistry::default(),
                PhaseRegistry::default(),
            ]),
            disposed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn flavor(&self) -> CacheFlavor {
        self.flavor
    }

    /// Wraps an async closure into an [`EventHandler`].
    pub fn handler<F, Fut>(f: F) -> EventHandler
    where
        F: Fn(Arc<EventPayload>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Arc::new(move |payload| f(payload).boxed())
    }

    /// Registers a handler for one event kind in the given phase.
    pub fn on(&self, kind: EventKind, phase: Phase, handler: EventHandler) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        self.phases.write()[phase.index()]
            .specific
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Registers a wildcard handler receiving every event in the phase.
    pub fn on_any(&self, phase: Phase, handler: EventHandler) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        self.phases.write()[phase.index()].any.push(handler);
    }

    /// Emits an event, awaiting each phase's handlers in order.
    pub async fn emit(&self, payload: EventPayload) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let payload = Arc::new(payload);
        for phase in PHASES {
            // Snapshot under the lock, await outside it: handlers may emit
            // follow-up events or register new handlers.
            let handlers: Vec<EventHandler> = {
                let phases = self.phases.read();
                let registry = &phases[phase.index()];
                registry
                    .specific
                    .get(&payload.kind)
                    .into_iter()
                    .flatten()
                    .chain(registry.any.iter())
                    .cloned()
                    .collect()
            };
            for handler in handlers {
                handler(Arc::clone(&payload)).await;
            }
        }
    }

    /// Drops every registered handler and rejects further registration and
    /// emission. Idempotent.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        let mut phases = self.phases.write();
        for registry in phases.iter_mut() {
            registry.specific.clear();
            registry.any.clear();
        }
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}
