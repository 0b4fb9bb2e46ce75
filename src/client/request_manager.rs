//! Correlation of outbound requests with inbound replies.
//!
//! ```text
//! create() ──► id ──► pending map ◄── fulfill(reply) / fail(id, err)
//!                        │
//! PendingRequest ◄───────┘ oneshot
//!   await_reply(deadline, cancel)
//!     ├─ reply      -> Ok(Message)
//!     ├─ deadline   -> Timeout   (entry removed, late reply discarded)
//!     └─ cancel     -> Canceled  (entry removed, late reply discarded)
//! ```
//!
//! An identifier stays reserved until its entry leaves the map, so two
//! pending requests never share one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, WireError};
use crate::protocol::{Encoding, Identifier, Message, Payload};

type Completion = oneshot::Sender<Result<Message>>;

struct Inner {
    pending: Mutex<HashMap<Identifier, Completion>>,
    last_id: AtomicU64,
}

/// Table of in-flight requests. Cheap to clone.
#[derive(Clone)]
pub struct RequestManager {
    inner: Arc<Inner>,
}

impl Default for RequestManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                last_id: AtomicU64::new(0),
            }),
        }
    }

    /// Reserve a fresh identifier and its completion slot.
    pub fn create(&self) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.inner.pending.lock();
        let identifier = loop {
            let candidate =
                Identifier::from_u64(self.inner.last_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1));
            if !candidate.is_zero() && !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(identifier, tx);
        drop(pending);

        PendingRequest {
            identifier,
            rx,
            manager: self.inner.clone(),
        }
    }

    /// Deliver a reply to its request.
    ///
    /// Returns the message back if no request is waiting for it (late,
    /// duplicate or unknown); the caller releases it.
    pub fn fulfill(&self, msg: Message) -> Option<Message> {
        let Some(identifier) = msg.identifier() else {
            return Some(msg);
        };
        let Some(tx) = self.inner.pending.lock().remove(&identifier) else {
            return Some(msg);
        };
        if let Err(Ok(msg)) = tx.send(Ok(msg)) {
            // The waiter gave up between lookup and send.
            msg.release();
        }
        None
    }

    /// Fail the request `identifier`. Returns false if none is pending.
    pub fn fail(&self, identifier: Identifier, err: WireError) -> bool {
        match self.inner.pending.lock().remove(&identifier) {
            Some(tx) => {
                let _ = tx.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Fail every pending request.
    pub fn fail_all(&self, err: WireError) {
        let drained: Vec<Completion> = self
            .inner
            .pending
            .lock()
            .drain()
            .map(|(_, tx)| tx)
            .collect();
        if !drained.is_empty() {
            debug!("failing {} pending requests: {}", drained.len(), err);
        }
        for tx in drained {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// Number of requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Check if `identifier` is awaiting a reply.
    pub fn is_pending(&self, identifier: Identifier) -> bool {
        self.inner.pending.lock().contains_key(&identifier)
    }
}

impl std::fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestManager")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// One in-flight request. Dropping it abandons the request.
pub struct PendingRequest {
    identifier: Identifier,
    rx: oneshot::Receiver<Result<Message>>,
    manager: Arc<Inner>,
}

impl PendingRequest {
    /// Identifier to put on the request frame.
    #[inline]
    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    /// Wait for the reply, the deadline or cancellation, whichever comes
    /// first.
    ///
    /// # Errors
    ///
    /// - `Timeout` when `deadline` passes
    /// - `Canceled` when `cancel` fires
    /// - the failure passed to `fail`/`fail_all`
    pub async fn await_reply(
        mut self,
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Message> {
        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        let canceled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            reply = &mut self.rx => reply.unwrap_or_else(|_| {
                Err(WireError::Disconnected("request abandoned".to_string()))
            }),
            _ = expired => Err(WireError::Timeout),
            _ = canceled => Err(WireError::Canceled),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.manager.pending.lock().remove(&self.identifier);
        self.rx.close();
        if let Ok(Ok(msg)) = self.rx.try_recv() {
            msg.release();
        }
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("identifier", &self.identifier)
            .finish()
    }
}

/// A successful reply. Holds the pooled buffer until released or dropped.
pub struct Reply {
    message: Message,
}

impl Reply {
    pub(crate) fn new(message: Message) -> Self {
        Self { message }
    }

    /// Payload encoding.
    pub fn encoding(&self) -> Encoding {
        self.message.encoding()
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        self.message.payload()
    }

    /// Payload as validated UTF-8.
    pub fn payload_str(&self) -> Result<&str> {
        self.message.payload_str()
    }

    /// Payload decoded according to its encoding.
    pub fn payload_string(&self) -> Result<String> {
        self.message.payload_string()
    }

    /// Copy the payload out and release the buffer.
    pub fn into_payload(self) -> Payload {
        let payload = self.message.payload_owned();
        self.message.release();
        payload
    }

    /// Return the buffer to its pool.
    pub fn release(self) {
        self.message.release();
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply")
            .field("encoding", &self.encoding())
            .field("len", &self.payload().len())
            .finish()
    }
}
