//! Bulkhead for provider calls
//!
//! Caps the number of concurrent in-flight calls to one provider. Callers
//! over the cap queue in FIFO order on the underlying semaphore; there is no
//! wait deadline. The permit is a guard: dropping it frees the slot.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::BulkheadConfig;
use crate::errors::InvocationError;

#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
}

/// An occupied bulkhead slot, released when dropped
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkheadStats {
    pub name: String,
    pub capacity: usize,
    pub in_flight: usize,
    pub available: usize,
    pub waiting: usize,
}

/// Counts a caller as waiting until it gets a permit or gives up
struct WaitGuard(Arc<AtomicUsize>);

impl WaitGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Bulkhead {
    pub fn new<S: Into<String>>(name: S, config: &BulkheadConfig) -> Self {
        Self::with_capacity(name, config.max_concurrent)
    }

    pub fn with_capacity<S: Into<String>>(name: S, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a free slot.
    ///
    /// Fails only once the bulkhead has been closed.
    pub async fn acquire(&self) -> Result<BulkheadPermit, InvocationError> {
        let _waiting = WaitGuard::enter(&self.waiting);

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| InvocationError::Cancelled {
                reason: format!("bulkhead '{}' closed", self.name),
            })?;

        debug!(
            "Bulkhead '{}' slot acquired ({}/{})",
            self.name,
            self.in_flight(),
            self.capacity
        );
        Ok(BulkheadPermit { _permit: permit })
    }

    /// Reject current and future waiters. Held permits stay valid.
    pub fn close(&self) {
        debug!("Closing bulkhead '{}'", self.name);
        self.semaphore.close();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            name: self.name.clone(),
            capacity: self.capacity,
            in_flight: self.in_flight(),
            available: self.available(),
            waiting: self.waiting(),
        }
    }
}
