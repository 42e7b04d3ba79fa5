//! Concurrency guards around generation and loading
//!
//! [`GenerationGate`] admits one generation at a time. [`SingleFlight`]
//! collapses concurrent calls with the same key into one execution whose
//! result is handed to every caller.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{Error, Result};

/// Semaphore of capacity one around `generate`
#[derive(Clone)]
pub struct GenerationGate {
    semaphore: Arc<Semaphore>,
}

impl Default for GenerationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationGate {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait until no other generation is running
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::InvalidRequest("generation gate closed".to_string()))
    }

    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

type SharedResult<V> = Shared<BoxFuture<'static, std::result::Result<V, Arc<Error>>>>;

/// Request de-duplicator keyed by `K`
pub struct SingleFlight<K, V>
where
    V: Clone,
{
    inflight: Arc<Mutex<HashMap<K, (u64, SharedResult<V>)>>>,
    next_id: AtomicU64,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `make()` for `key` unless a call for the same key is in flight, in
    /// which case wait for that call's result. Errors reach every waiter as
    /// [`Error::Shared`].
    pub async fn run<F, Fut>(&self, key: K, make: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some((_, shared)) => {
                    debug!("Joining in-flight request");
                    shared.clone()
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let registry = Arc::clone(&self.inflight);
                    let cleanup_key = key.clone();
                    let fut = make();
                    let shared = async move {
                        let result = fut.await.map_err(Arc::new);
                        let mut inflight = registry.lock();
                        if inflight.get(&cleanup_key).map(|(i, _)| *i) == Some(id) {
                            inflight.remove(&cleanup_key);
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key, (id, shared.clone()));
                    shared
                }
            }
        };

        shared.await.map_err(Error::Shared)
    }

    /// Number of keys currently in flight
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }
}
