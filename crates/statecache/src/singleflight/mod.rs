//! Collapses concurrent computations of the same key into one.
//!
//! Every key moves through `absent -> pending -> resolved -> absent`. The first caller of
//! [`SingleFlight::run`] (or [`run_blocking`](SingleFlight::run_blocking)) for an absent key
//! becomes the owner and is the only one to invoke its producer. Everyone arriving while the key
//! is pending attaches to the same flight and receives a clone of the exact outcome, value or
//! error. The entry is dropped from the registry as soon as the outcome is known, so the next call
//! starts over and failures are never remembered.
//!
//! Async owners run their producer on a spawned task: a caller that stops waiting does not take
//! the computation down with it. Blocking owners run the producer on their own thread. Both kinds
//! of flights live in the same registry, so async and blocking callers deduplicate with each
//! other.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::utils::defer::defer;


/// The outcome of a flight as seen by attached callers.
type Landing<T, E> = Result<Result<T, E>, Aborted>;

type Flight<T, E> = Shared<BoxFuture<'static, Landing<T, E>>>;

/// The producer of a flight panicked or was torn down before it finished.
#[derive(Debug, Clone, Copy)]
struct Aborted;

struct Entry {
    id: u64,
    /// A `Flight<T, E>`, typed by the caller.
    flight: Box<dyn Any + Send + Sync>,
}

/// Deduplication counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SingleFlightStats {
    /// All calls that went through the coordinator.
    pub total: u64,
    /// Calls that attached to a pending flight instead of computing.
    pub deduplicated: u64,
    /// Calls that ran their producer.
    pub unique: u64,
}

impl SingleFlightStats {
    /// Share of calls that were served by another caller's computation.
    pub fn dedup_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.deduplicated as f64 / self.total as f64
    }
}

#[derive(Default)]
struct Registry {
    flights: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
    total: AtomicU64,
    deduplicated: AtomicU64,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // the map is consistent after every single operation, a poisoned lock is still usable
        self.flights
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Removes the entry of `key`, unless it already belongs to a newer flight.
    fn land(&self, key: &str, id: u64) {
        let mut flights = self.lock();
        if flights.get(key).is_some_and(|entry| entry.id == id) {
            flights.remove(key);
        }
    }
}

/// What a caller found when it asked for a key.
enum Boarding<'a, T, E> {
    /// A flight for the key is pending.
    Attached(Flight<T, E>),
    /// The key is pending with a flight of a different type.
    Conflict,
    /// There is no flight yet, the caller becomes the owner.
    Vacant(Seat<'a>),
}

enum Plan<T, E, Fut> {
    Wait(Flight<T, E>),
    Direct(Fut),
}

/// A claim on an absent key, holding the registry lock until the owner's flight is registered.
struct Seat<'a> {
    flights: MutexGuard<'a, HashMap<String, Entry>>,
    key: String,
    id: u64,
}

impl Seat<'_> {
    fn occupy<T, E>(mut self, flight: Flight<T, E>)
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let entry = Entry {
            id: self.id,
            flight: Box::new(flight),
        };
        self.flights.insert(self.key, entry);
    }
}

/// A registry of in-flight computations.
///
/// Clones share the registry. [`SingleFlight::global`] is the process-wide instance used by cached
/// functions unless configured otherwise.
#[derive(Clone, Default)]
pub struct SingleFlight {
    registry: Arc<Registry>,
}

impl std::fmt::Debug for SingleFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static SingleFlight {
        static GLOBAL: OnceLock<SingleFlight> = OnceLock::new();
        GLOBAL.get_or_init(SingleFlight::new)
    }

    /// Number of pending flights.
    pub fn in_flight(&self) -> usize {
        self.registry.lock().len()
    }

    /// Keys of all pending flights, sorted.
    pub fn in_flight_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.registry.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> SingleFlightStats {
        let total = self.registry.total.load(Ordering::Relaxed);
        let deduplicated = self.registry.deduplicated.load(Ordering::Relaxed);
        SingleFlightStats {
            total,
            deduplicated,
            unique: total.saturating_sub(deduplicated),
        }
    }

    fn board<T, E>(&self, key: &str) -> Boarding<'_, T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        self.registry.total.fetch_add(1, Ordering::Relaxed);
        let flights = self.registry.lock();

        if !flights.contains_key(key) {
            metric!(counter("singleflight.started") += 1);
            return Boarding::Vacant(Seat {
                flights,
                key: key.to_owned(),
                id: self.registry.next_id.fetch_add(1, Ordering::Relaxed),
            });
        }

        match flights[key].flight.downcast_ref::<Flight<T, E>>() {
            Some(flight) => {
                self.registry.deduplicated.fetch_add(1, Ordering::Relaxed);
                metric!(counter("singleflight.attached") += 1);
                Boarding::Attached(flight.clone())
            }
            None => {
                tracing::warn!("Key {} is in flight with a different value type", key);
                Boarding::Conflict
            }
        }
    }

    /// Runs `producer` unless a computation for `key` is already pending, and returns the
    /// outcome of whichever computation ran.
    ///
    /// The future returned by `producer` is spawned onto the current tokio runtime and always
    /// runs to completion, even if every caller stops waiting for it. `producer` itself is called
    /// after the key was registered and the registry unlocked.
    ///
    /// # Panics
    ///
    /// Panics outside of a tokio runtime, and when the computation panics.
    pub async fn run<T, E, F, Fut>(&self, key: &str, producer: F) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        // decide under the lock, but never hold it across an await
        let plan = match self.board::<T, E>(key) {
            Boarding::Attached(flight) => Plan::Wait(flight),
            Boarding::Conflict => Plan::Direct(producer()),
            Boarding::Vacant(seat) => {
                let id = seat.id;
                let (sender, receiver) = oneshot::channel::<Result<T, E>>();
                let flight = receiver
                    .map(|received| received.map_err(|_| Aborted))
                    .boxed()
                    .shared();
                seat.occupy(flight.clone());

                // the registry is unlocked again, the producer is free to use it
                let registry = Arc::clone(&self.registry);
                let owned_key = key.to_owned();
                let landing = defer(move || registry.land(&owned_key, id));
                let computation = producer();

                // a panicking computation drops the sender, which aborts attached callers
                tokio::spawn(async move {
                    let outcome = computation.await;
                    drop(landing);
                    sender.send(outcome).ok();
                });
                Plan::Wait(flight)
            }
        };

        let flight = match plan {
            Plan::Wait(flight) => flight,
            Plan::Direct(computation) => return computation.await,
        };
        match flight.await {
            Ok(outcome) => outcome,
            Err(Aborted) => panic!("computation for {key} panicked"),
        }
    }

    /// The blocking counterpart of [`run`](Self::run).
    ///
    /// An owner runs `producer` on the calling thread, attached callers block until it is done.
    /// Must not be called from within an async context.
    ///
    /// # Panics
    ///
    /// Panics when the computation panics. The owner resumes the original panic.
    pub fn run_blocking<T, E, F>(&self, key: &str, producer: F) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T, E>,
    {
        let (sender, id) = match self.board::<T, E>(key) {
            Boarding::Attached(flight) => {
                return match futures::executor::block_on(flight) {
                    Ok(outcome) => outcome,
                    Err(Aborted) => panic!("computation for {key} panicked"),
                };
            }
            Boarding::Conflict => return producer(),
            Boarding::Vacant(seat) => {
                let id = seat.id;
                let (sender, receiver) = oneshot::channel::<Result<T, E>>();
                let flight = receiver
                    .map(|received| received.map_err(|_| Aborted))
                    .boxed()
                    .shared();
                seat.occupy(flight);
                (sender, id)
            }
        };

        // on unwind the entry is removed first, then the dropped sender aborts attached callers
        let landing = defer(|| self.registry.land(key, id));
        let outcome = panic::catch_unwind(AssertUnwindSafe(producer));
        drop(landing);

        match outcome {
            Ok(outcome) => {
                sender.send(outcome.clone()).ok();
                outcome
            }
            Err(payload) => {
                drop(sender);
                panic::resume_unwind(payload)
            }
        }
    }
}
