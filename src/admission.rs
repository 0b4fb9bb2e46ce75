//! Per-connection admission control for handler execution.
//!
//! Every server-side connection owns an [`AdmissionController`] sized by its
//! concurrency limit. The read loop acquires one [`AdmissionSlot`] before it
//! spawns a request or signal handler and the slot travels with the handler
//! task, so it is returned when the task ends, including after a panic.
//!
//! Acquisition blocks the read loop, so a client that floods a connection
//! with slow requests stops being read from until a handler finishes. The
//! client's own request deadline does not apply here.
//!
//! # Configuration
//!
//! - `limit`: maximum concurrently running handlers (default: 256, 0 = unlimited)

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::{Result, WireError};

/// Default maximum number of concurrently executing handlers per connection.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 256;

/// Counting semaphore bounding concurrent handlers on one connection.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl AdmissionController {
    /// Create a controller admitting at most `limit` handlers.
    ///
    /// A limit of 0 disables the bound.
    pub fn new(limit: usize) -> Self {
        let permits = if limit == 0 {
            Semaphore::MAX_PERMITS
        } else {
            limit
        };
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            limit,
        }
    }

    /// Configured limit (0 = unlimited).
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of slots currently free.
    #[inline]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait until a slot is free and take it.
    ///
    /// # Errors
    ///
    /// Returns `ServerShutdown` once the controller has been closed.
    pub async fn acquire(&self) -> Result<AdmissionSlot> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map(|permit| AdmissionSlot { _permit: permit })
            .map_err(|_| WireError::ServerShutdown)
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<AdmissionSlot> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(AdmissionSlot { _permit: permit }),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    /// Wake every waiter with `ServerShutdown` and refuse further acquisitions.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY_LIMIT)
    }
}

/// One unit of handler concurrency. Dropping it frees the slot.
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
}
