//! Transport module - the socket contract the protocol engine runs on.
//!
//! The engine assumes nothing beyond an ordered, reliable, message-framed
//! byte stream with a close signal:
//!
//! ```text
//! Socket (trait)
//!     │
//!     ├── ClientSocket (trait)   dial(deadline) before use
//!     │   └── MemoryClientSocket
//!     │
//!     └── MemorySocket           in-process pair, used by tests and demos
//!
//! Listener (trait)
//!     └── MemoryListener
//! ```
//!
//! Adapters for a concrete transport (WebSocket, QUIC streams, ...) implement
//! the same traits outside this crate.

mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::time::Instant;

use crate::error::{Result, WireError};

pub use memory::{MemoryClientSocket, MemoryListener, MemoryNetwork, MemorySocket};

/// Why a read did not produce a frame.
#[derive(Debug, Clone, Error)]
pub enum ReadError {
    /// The socket was closed by either side.
    #[error("socket closed")]
    Closed,
    /// The read deadline passed.
    #[error("read deadline exceeded")]
    Timeout,
    /// Any other transport failure.
    #[error(transparent)]
    Failed(#[from] WireError),
}

impl From<ReadError> for WireError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Closed => WireError::Disconnected("socket closed".to_string()),
            ReadError::Timeout => WireError::Disconnected("read deadline exceeded".to_string()),
            ReadError::Failed(err) => err,
        }
    }
}

/// A connected, message-framed socket.
///
/// Writes are safe to issue concurrently; each call writes one whole frame.
/// Only one task reads at a time.
#[async_trait]
pub trait Socket: Send + Sync + 'static {
    /// Write one frame.
    ///
    /// # Errors
    ///
    /// Returns `Disconnected` if the socket is closed.
    async fn write(&self, frame: Bytes) -> Result<()>;

    /// Read the next frame into `buf`, appending to it.
    ///
    /// A `None` deadline waits indefinitely.
    async fn read(
        &self,
        buf: &mut BytesMut,
        deadline: Option<Instant>,
    ) -> std::result::Result<(), ReadError>;

    /// Close the socket. Idempotent.
    async fn close(&self);

    /// Address of the remote peer, if known.
    fn remote_addr(&self) -> Option<String>;

    /// Check if the socket is still usable.
    fn is_connected(&self) -> bool;
}

/// A client-side socket that can be (re)dialed.
#[async_trait]
pub trait ClientSocket: Socket {
    /// Establish a new connection, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns `Disconnected` if the peer is unreachable or the deadline passes.
    async fn dial(&self, deadline: Instant) -> Result<()>;
}

/// A newly accepted server-side socket.
pub struct Accepted {
    /// The connected socket.
    pub socket: Arc<dyn Socket>,
    /// User agent reported by the peer, if any.
    pub user_agent: Option<String>,
}

impl std::fmt::Debug for Accepted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted")
            .field("remote_addr", &self.socket.remote_addr())
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// Source of inbound sockets for a server.
#[async_trait]
pub trait Listener: Send + 'static {
    /// Wait for the next inbound socket. `Ok(None)` means the listener is closed.
    async fn accept(&mut self) -> Result<Option<Accepted>>;
}
