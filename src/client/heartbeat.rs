//! Client heartbeat.
//!
//! The server enforces a read deadline; a quiet client keeps its
//! connection alive by sending a probe whenever nothing else was written for
//! `interval`. Every outbound write resets the countdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::build_heartbeat;
use crate::transport::ClientSocket;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// A probe could not be written; the socket was closed.
    Failed,
    /// The heartbeat was stopped.
    Cancelled,
}

/// Heartbeat controller owned by the client.
#[derive(Debug, Default)]
pub(crate) struct Heartbeat {
    reset: Arc<Notify>,
    running: Mutex<Option<CancellationToken>>,
}

impl Heartbeat {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start probing `socket` every `interval` of silence, replacing any
    /// previous loop.
    pub(crate) fn start(&self, socket: Arc<dyn ClientSocket>, interval: Duration) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.running.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        let reset = self.reset.clone();
        tokio::spawn(async move {
            let result = run_heartbeat(socket, interval, reset, cancel).await;
            debug!("heartbeat stopped: {:?}", result);
        });
    }

    /// Restart the countdown after outbound traffic.
    #[inline]
    pub(crate) fn reset(&self) {
        self.reset.notify_one();
    }

    pub(crate) fn stop(&self) {
        if let Some(cancel) = self.running.lock().take() {
            cancel.cancel();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

/// Probe `socket` after every `interval` without a reset.
///
/// A failed probe closes the socket, so the read loop observes the
/// disconnect exactly as it would a read failure.
pub async fn run_heartbeat(
    socket: Arc<dyn ClientSocket>,
    interval: Duration,
    reset: Arc<Notify>,
    cancel: CancellationToken,
) -> HeartbeatResult {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            () = reset.notified() => continue,
            () = tokio::time::sleep(interval) => {
                if let Err(e) = socket.write(build_heartbeat()).await {
                    warn!("heartbeat failed: {}", e);
                    socket.close().await;
                    return HeartbeatResult::Failed;
                }
            }
        }
    }
}
