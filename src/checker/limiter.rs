//! Concurrency limiter bounding in-flight probes

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Upper bound accepted for a run's concurrency
pub const MAX_CONCURRENCY: usize = 5000;

/// Counting limiter handing out one slot per probe.
///
/// Cloning shares the same slots.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// A held slot; dropping it frees the slot on every exit path.
#[derive(Debug)]
pub struct SlotPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConcurrencyLimiter {
    /// Create a limiter with `limit` slots (at least one)
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> SlotPermit {
        // The semaphore is never closed, so acquisition only fails if that
        // invariant breaks; in that case the caller runs unthrottled.
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok();
        SlotPermit { _permit: permit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held
    pub fn in_use(&self) -> usize {
        self.limit - self.available()
    }
}
