//! Cooperative-async building blocks: debounce, single-flight, per-key
//! serialization, and waiter coalescing.
//!
//! These are the primitives the proxy, the eviction engine, and the managers
//! schedule through. All of them are cancellation-safe: dropping a waiting
//! caller never wedges the structure.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Trailing-edge debouncer: the first call schedules the work after `delay`;
/// further calls within the window coalesce into that one run.
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    /// Schedules `work` to run after the delay unless a run is already
    /// pending.
    pub fn schedule<F, Fut>(&self, work: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let delay = self.delay;
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            work().await;
        }));
    }

    /// Cancels the pending run, if any. Idempotent.
    pub fn cancel(&self) {
        if let Some(handle) = self.pending.lock().take() {
            handle.abort();
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

/// Dedupe guard for background passes that must not overlap (e.g. freeing
/// memory): `try_begin` yields a guard only when no other flight is active.
#[derive(Default)]
pub struct SingleFlight {
    running: Arc<AtomicBool>,
}

impl SingleFlight {
    /// Claims the flight. Returns `None` while another holder is active.
    #[must_use]
    pub fn try_begin(&self) -> Option<FlightGuard> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(FlightGuard {
                running: Arc::clone(&self.running),
            })
        } else {
            None
        }
    }
}

/// RAII token for an active [`SingleFlight`] pass.
pub struct FlightGuard {
    running: Arc<AtomicBool>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Class of an operation contending on a key gate.
///
/// The only priority rule is that queued reads overtake queued writes
/// (set/remove); within a class the order is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    Read,
    Write,
}

#[derive(Default)]
struct GateState {
    busy: bool,
    read_waiters: VecDeque<oneshot::Sender<()>>,
    write_waiters: VecDeque<oneshot::Sender<()>>,
}

#[derive(Default)]
struct KeyGate {
    state: Mutex<GateState>,
}

/// Per-key gates serializing engine operations on the same record.
///
/// A gate exists only while held or contended; idle gates are removed so the
/// map does not grow with the historical key space.
pub struct KeyGates<K: Eq + Hash + Clone> {
    gates: Mutex<HashMap<K, Arc<KeyGate>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyGates<K> {
    fn default() -> Self {
        Self {
            gates: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyGates<K> {
    /// Acquires the gate for `key`, waiting behind the current holder.
    pub async fn acquire(self: &Arc<Self>, key: K, class: OpClass) -> GateGuard<K> {
        let waiter = {
            // Lock order everywhere: map, then gate state.
            let mut map = self.gates.lock();
            let gate = Arc::clone(map.entry(key.clone()).or_default());
            let mut state = gate.state.lock();
            if state.busy {
                let (tx, rx) = oneshot::channel();
                match class {
                    OpClass::Read => state.read_waiters.push_back(tx),
                    OpClass::Write => state.write_waiters.push_back(tx),
                }
                Some(rx)
            } else {
                state.busy = true;
                None
            }
        };

        if let Some(rx) = waiter {
            // A dropped sender means the gates map itself went away; treat
            // the gate as handed over either way.
            let _ = rx.await;
        }

        GateGuard {
            gates: Arc::clone(self),
            key: Some(key),
        }
    }

    fn release(&self, key: &K) {
        let mut map = self.gates.lock();
        let Some(gate) = map.get(key).cloned() else {
            return;
        };
        let mut state = gate.state.lock();
        loop {
            let next = state
                .read_waiters
                .pop_front()
                .or_else(|| state.write_waiters.pop_front());
            match next {
                // Hand the gate over; busy stays true for the successor.
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        return;
                    }
                    // Successor gave up waiting; try the next one.
                }
                None => break,
            }
        }
        state.busy = false;
        drop(state);
        map.remove(key);
    }
}

/// RAII token for a held key gate; releases (and hands over) on drop.
pub struct GateGuard<K: Eq + Hash + Clone> {
    gates: Arc<KeyGates<K>>,
    key: Option<K>,
}

impl<K: Eq + Hash + Clone> Drop for GateGuard<K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.gates.release(&key);
        }
    }
}

type SharedFuture<T> = Shared<BoxFuture<'static, T>>;

/// Waiter coalescing: concurrent identical operations on the same key join
/// one in-flight task and share its outcome.
pub struct SharedFlights<K: Eq + Hash + Clone, T: Clone> {
    inflight: Mutex<HashMap<K, SharedFuture<T>>>,
}

impl<K: Eq + Hash + Clone, T: Clone> Default for SharedFlights<K, T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, T> SharedFlights<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    /// Joins the in-flight task for `key`, or spawns `make()` as the new one.
    pub async fn run<F>(&self, key: K, make: impl FnOnce() -> F) -> T
    where
        F: Future<Output = T> + Send + 'static,
    {
        let flight = {
            let mut map = self.inflight.lock();
            if let Some(existing) = map.get(&key) {
                existing.clone()
            } else {
                let shared = make().boxed().shared();
                map.insert(key.clone(), shared.clone());
                shared
            }
        };

        let outcome = flight.clone().await;

        // Whoever finishes first clears the slot; guard against removing a
        // newer flight that replaced ours.
        let mut map = self.inflight.lock();
        if map.get(&key).is_some_and(|current| current.ptr_eq(&flight)) {
            map.remove(&key);
        }
        outcome
    }

    /// Number of currently in-flight tasks. Test hook.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inflight.lock().is_empty()
    }
}
