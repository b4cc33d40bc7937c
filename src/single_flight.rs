//! Single-flight coordination.
//!
//! For a given key at most one producer runs at a time. Concurrent callers
//! join the in-flight producer and observe the same outcome. Successful
//! values are published to a [`Registry`]; failures reach every waiter and
//! are never cached, so the next caller starts a fresh wave.
//!
//! Used for shared-context cache creation, file uploads and remote
//! downloads.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::registry::Registry;

#[derive(Debug, Clone)]
enum Outcome<V> {
    Value(V),
    Failed(PipelineError),
    Cancelled,
}

impl<V> Outcome<V> {
    fn into_result(self) -> Result<V, PipelineError> {
        match self {
            Outcome::Value(v) => Ok(v),
            Outcome::Failed(e) => Err(e),
            Outcome::Cancelled => Err(PipelineError::Cancelled),
        }
    }
}

type Slot<V> = watch::Receiver<Option<Outcome<V>>>;

enum Role<V> {
    Producer(watch::Sender<Option<Outcome<V>>>),
    Waiter(Slot<V>),
}

/// Per-key single-flight coordinator backed by a registry.
pub struct SingleFlight<V> {
    registry: Arc<Registry<V>>,
    inflight: Mutex<HashMap<String, Slot<V>>>,
}

/// Releases the in-flight slot when the producer finishes or is dropped.
///
/// If the producer future is dropped mid-flight its sender goes with it, so
/// waiters of an abandoned producer observe cancellation.
struct FlightGuard<'a, V> {
    inflight: &'a Mutex<HashMap<String, Slot<V>>>,
    key: &'a str,
}

impl<V> Drop for FlightGuard<'_, V> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight.remove(self.key);
    }
}

impl<V> SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(registry: Arc<Registry<V>>) -> Self {
        Self {
            registry,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry<V>> {
        &self.registry
    }

    /// Number of keys with a producer currently running.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot<V>>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the registered value for `key`, join the in-flight producer,
    /// or become the producer.
    ///
    /// `cancel` is this caller's cancellation signal. A producer that is
    /// cancelled releases the key and surfaces [`PipelineError::Cancelled`]
    /// to every waiter.
    pub async fn run<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
        producer: F,
    ) -> Result<V, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, PipelineError>>,
    {
        // Double-check the registry under the in-flight lock so a value
        // published between a caller's own lookup and here is reused.
        let role = {
            let mut inflight = self.lock();
            if let Some(value) = self.registry.get(key) {
                tracing::debug!(key = %key, "single-flight registry hit");
                return Ok(value);
            }
            match inflight.get(key) {
                Some(slot) => Role::Waiter(slot.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.to_string(), rx);
                    Role::Producer(tx)
                }
            }
        };

        match role {
            Role::Waiter(slot) => {
                tracing::debug!(key = %key, "joining in-flight producer");
                wait_for(slot, cancel).await
            }
            Role::Producer(tx) => {
                let guard = FlightGuard {
                    inflight: &self.inflight,
                    key,
                };

                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Outcome::Cancelled,
                    result = producer() => match result {
                        Ok(value) => Outcome::Value(value),
                        Err(PipelineError::Cancelled) => Outcome::Cancelled,
                        Err(e) => Outcome::Failed(e),
                    },
                };

                if let Outcome::Value(value) = &outcome {
                    self.registry.insert(key, value.clone(), ttl);
                }
                drop(guard);
                // No receivers left is fine: nobody was waiting.
                let _ = tx.send(Some(outcome.clone()));
                outcome.into_result()
            }
        }
    }
}

async fn wait_for<V: Clone>(
    mut slot: Slot<V>,
    cancel: &CancellationToken,
) -> Result<V, PipelineError> {
    loop {
        if let Some(outcome) = slot.borrow_and_update().clone() {
            return outcome.into_result();
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            changed = slot.changed() => {
                if changed.is_err() {
                    // Producer vanished without publishing.
                    return match slot.borrow().clone() {
                        Some(outcome) => outcome.into_result(),
                        None => Err(PipelineError::Cancelled),
                    };
                }
            }
        }
    }
}
