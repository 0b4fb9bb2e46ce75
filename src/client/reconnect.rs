//! Single-flight reconnection and the "dam" that releases its waiters.
//!
//! Every caller that needs a connection joins the current barrier. The first
//! joiner also starts the supervisor; later joiners only wait. When the
//! supervisor finishes it flushes the barrier with its outcome, waking every
//! waiter at once, and installs a fresh barrier for the next cycle.
//!
//! ```text
//! join() ──► (barrier, start?) ──► start? spawn supervisor
//!                │                        │ retry while Disconnected
//!                ▼                        ▼
//!          barrier.wait() ◄────────── flush(outcome)
//! ```

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::ClientInner;
use crate::error::{Result, WireError};

/// One connection cycle's outcome, set exactly once.
#[derive(Debug, Default)]
pub(crate) struct Barrier {
    outcome: OnceLock<Option<WireError>>,
    notify: Notify,
}

impl Barrier {
    /// Wait until the barrier is flushed.
    pub(crate) async fn wait(&self) -> Result<()> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.outcome.get().is_none() {
            notified.await;
        }
        match self.outcome.get() {
            Some(Some(err)) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    fn release(&self, outcome: Option<WireError>) {
        let _ = self.outcome.set(outcome);
        self.notify.notify_waiters();
    }
}

#[derive(Debug)]
struct DamState {
    barrier: Arc<Barrier>,
    running: bool,
}

/// Broadcast primitive guarding the reconnection supervisor.
#[derive(Debug)]
pub(crate) struct Dam {
    state: Mutex<DamState>,
}

impl Default for Dam {
    fn default() -> Self {
        Self::new()
    }
}

impl Dam {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(DamState {
                barrier: Arc::new(Barrier::default()),
                running: false,
            }),
        }
    }

    /// Join the current cycle. The second value is true when the caller
    /// must start the supervisor.
    pub(crate) fn join(&self) -> (Arc<Barrier>, bool) {
        let mut state = self.state.lock();
        let start = !state.running;
        state.running = true;
        (state.barrier.clone(), start)
    }

    /// Check if a supervisor is running.
    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// End the cycle, waking every waiter with `outcome`.
    pub(crate) fn flush(&self, outcome: Option<WireError>) {
        let barrier = {
            let mut state = self.state.lock();
            state.running = false;
            std::mem::replace(&mut state.barrier, Arc::new(Barrier::default()))
        };
        barrier.release(outcome);
    }
}

/// Retry `connect` until it succeeds, fails for good, or autoconnect is
/// switched off, then flush the dam with the outcome.
pub(crate) async fn supervise(inner: Arc<ClientInner>) {
    let interval = inner.options.reconnection_interval;
    let mut attempts = 0u32;
    let outcome = loop {
        if !inner.autoconnect_enabled() {
            break Some(WireError::Disconnected(
                "autoconnect was deactivated".to_string(),
            ));
        }
        attempts += 1;
        match inner.connect().await {
            Ok(()) => {
                info!("reconnected after {} attempt(s)", attempts);
                break None;
            }
            Err(e) if e.is_disconnected() => {
                debug!("reconnect attempt {} failed: {}", attempts, e);
                tokio::time::sleep(interval).await;
            }
            Err(e) => {
                warn!("giving up reconnecting: {}", e);
                break Some(e);
            }
        }
    };
    inner.dam.flush(outcome);
}
