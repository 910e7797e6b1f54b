//! Coalescing of concurrent duplicate operations.
//!
//! The first caller starts the operation; callers arriving while it is in flight
//! await the same shared future and observe the same outcome. Once the outcome is
//! known the slot is cleared, so the next caller starts a fresh operation.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;

type SharedFlight<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// A single in-flight slot for an operation producing `Result<T, E>`
pub struct SingleFlight<T, E>
where
    T: Clone,
    E: Clone,
{
    slot: Mutex<Option<SharedFlight<T, E>>>,
}

impl<T, E> SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Whether an operation is currently in flight
    pub fn in_flight(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Join the in-flight operation, or start one with `start` if there is none.
    ///
    /// `start` is only invoked when this caller becomes the leader.
    pub async fn run<F, Fut>(&self, start: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let flight = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let flight = start().boxed().shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };

        let outcome = flight.clone().await;

        // Whoever observes completion first clears the slot, but only if it still
        // holds this flight and not a newer one.
        let mut slot = self.slot.lock();
        if slot
            .as_ref()
            .map_or(false, |current| Shared::ptr_eq(current, &flight))
        {
            *slot = None;
        }

        outcome
    }
}

impl<T, E> Default for SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
