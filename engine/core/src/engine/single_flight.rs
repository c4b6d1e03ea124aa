//! Request coalescing
//!
//! Concurrent callers asking for the same key share one underlying future.
//! The map only holds a weak handle, so when every caller has gone away the
//! shared future is dropped and its work is cancelled.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;

type Slot<T> = (u64, WeakShared<BoxFuture<'static, T>>);

/// A joined or freshly started flight
pub struct Flight<T: Clone> {
    pub future: Shared<BoxFuture<'static, T>>,
    /// `true` when this caller started the flight
    pub leader: bool,
}

/// Coalesces concurrent work by key
pub struct SingleFlight<K, T> {
    flights: Arc<Mutex<HashMap<K, Slot<T>>>>,
    next_id: AtomicU64,
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> std::fmt::Debug for SingleFlight<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.flights.lock().len())
            .finish()
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Join the live flight for `key`, or start one with `start`
    ///
    /// `start` runs under the map lock, so it must not block; an error from
    /// it is returned without registering a flight.
    pub fn join_or_start<E>(
        &self,
        key: K,
        start: impl FnOnce() -> Result<BoxFuture<'static, T>, E>,
    ) -> Result<Flight<T>, E> {
        let mut flights = self.flights.lock();
        if let Some(future) = flights.get(&key).and_then(|(_, weak)| weak.upgrade()) {
            return Ok(Flight { future, leader: false });
        }

        let work = start()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = FlightGuard {
            flights: self.flights.clone(),
            key: key.clone(),
            id,
        };
        let future = async move {
            let _guard = guard;
            work.await
        }
        .boxed()
        .shared();

        if let Some(weak) = future.downgrade() {
            flights.insert(key, (id, weak));
        }
        Ok(Flight { future, leader: true })
    }

    /// Flights currently registered
    #[must_use]
    pub fn len(&self) -> usize {
        self.flights.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unregisters a flight when its future completes or is dropped
struct FlightGuard<K: Eq + Hash, T> {
    flights: Arc<Mutex<HashMap<K, Slot<T>>>>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, T> Drop for FlightGuard<K, T> {
    fn drop(&mut self) {
        let mut flights = self.flights.lock();
        if flights.get(&self.key).is_some_and(|(id, _)| *id == self.id) {
            flights.remove(&self.key);
        }
    }
}
