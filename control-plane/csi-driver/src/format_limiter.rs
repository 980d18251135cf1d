//! Format and Mount Concurrency Limiter
//!
//! Running several mkfs/fsck processes at the same time has been observed to cause memory
//! pressure on small nodes, so formatting mounts take a slot from a node-wide pool first.
//! Waiting for a slot is bounded: when the wait times out the operation goes ahead without one.
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{trace, warn};

/// A node-wide pool of format and mount slots.
#[derive(Debug, Clone)]
pub struct FormatMountLimiter {
    slots: Option<Arc<Semaphore>>,
    timeout: Duration,
}

impl FormatMountLimiter {
    /// Create a new limiter with `capacity` slots.
    /// A capacity of 0 or less disables the limiter.
    pub fn new(capacity: i64, timeout: Duration) -> Self {
        let slots = usize::try_from(capacity)
            .ok()
            .filter(|capacity| *capacity > 0)
            .map(|capacity| Arc::new(Semaphore::new(capacity)));
        Self { slots, timeout }
    }
    /// A limiter which never limits.
    pub fn disabled() -> Self {
        Self {
            slots: None,
            timeout: Duration::ZERO,
        }
    }
    /// Number of currently free slots, None if disabled.
    pub fn available(&self) -> Option<usize> {
        self.slots.as_ref().map(|slots| slots.available_permits())
    }

    /// Reserve a slot, waiting up to the configured timeout.
    /// The returned `FormatMountSlot` holds the slot until dropped; if the wait timed out (or the
    /// limiter is disabled) it holds nothing and the caller proceeds regardless.
    pub async fn reserve(&self) -> FormatMountSlot {
        let Some(slots) = &self.slots else {
            return FormatMountSlot { permit: None };
        };
        match tokio::time::timeout(self.timeout, slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                trace!("Format and mount slot reserved");
                FormatMountSlot {
                    permit: Some(permit),
                }
            }
            Ok(Err(error)) => {
                // the semaphore is never closed, but don't hold up the caller if it was
                warn!(%error, "Format and mount slot pool is closed, proceeding without a slot");
                FormatMountSlot { permit: None }
            }
            Err(_) => {
                warn!(
                    timeout = ?self.timeout,
                    "Timed out waiting for a format and mount slot, proceeding without one"
                );
                FormatMountSlot { permit: None }
            }
        }
    }

    /// Run the given format and mount future while holding a slot (if one could be reserved).
    /// The slot is released once the future completes, whatever its result.
    pub async fn run<F: Future>(&self, operation: F) -> F::Output {
        let _slot = self.reserve().await;
        operation.await
    }
}

/// A reservation in the `FormatMountLimiter` pool.
#[derive(Debug)]
pub struct FormatMountSlot {
    permit: Option<OwnedSemaphorePermit>,
}

impl FormatMountSlot {
    /// Whether this reservation actually holds a slot.
    pub fn is_reserved(&self) -> bool {
        self.permit.is_some()
    }
}
