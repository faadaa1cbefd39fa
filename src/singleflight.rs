//! Per-key in-flight coordination.
//!
//! The first caller for a key starts the computation on its own task; later
//! callers for the same key subscribe to its result instead of starting
//! another. The computation is detached from its callers: a caller that is
//! dropped or times out does not cancel it, and the key is released as soon
//! as the computation finishes (or panics).

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlightError {
    #[error("in-flight computation ended without a result")]
    Abandoned,
}

/// Whether a caller started the computation or joined an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

type Flights<K, V> = Arc<Mutex<HashMap<K, watch::Receiver<Option<V>>>>>;

pub struct SingleFlight<K, V> {
    flights: Flights<K, V>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Removes the key when the flight task ends, including by panic.
struct FlightGuard<K: Eq + Hash, V> {
    flights: Flights<K, V>,
    key: K,
}

impl<K: Eq + Hash, V> Drop for FlightGuard<K, V> {
    fn drop(&mut self) {
        lock(&self.flights).remove(&self.key);
    }
}

fn lock<K, V>(flights: &Flights<K, V>) -> MutexGuard<'_, HashMap<K, watch::Receiver<Option<V>>>> {
    // the map holds no invariant a panicking holder could break
    flights.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a computation running
    pub fn in_flight(&self) -> usize {
        lock(&self.flights).len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        lock(&self.flights).contains_key(key)
    }

    /// Run `compute` for `key` unless a computation for it is already in
    /// flight, and wait for the shared result.
    ///
    /// `compute` is only called by the leader. Must be called within a
    /// tokio runtime.
    pub async fn run<F, Fut>(&self, key: K, compute: F) -> Result<(V, Role), FlightError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (mut rx, role) = {
            let mut flights = lock(&self.flights);
            match flights.get(&key) {
                Some(rx) => (rx.clone(), Role::Follower),
                None => {
                    let (tx, rx) = watch::channel(None);
                    flights.insert(key.clone(), rx.clone());

                    let guard = FlightGuard {
                        flights: self.flights.clone(),
                        key,
                    };
                    let fut = compute();
                    tokio::spawn(async move {
                        let value = fut.await;
                        drop(guard);
                        // no receivers left is fine; the value is simply dropped
                        let _ = tx.send(Some(value));
                    });

                    (rx, Role::Leader)
                }
            }
        };

        let value = rx
            .wait_for(|v| v.is_some())
            .await
            .map_err(|_| FlightError::Abandoned)?
            .clone()
            .ok_or(FlightError::Abandoned)?;

        Ok((value, role))
    }
}
