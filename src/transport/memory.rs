//! In-process message-framed transport.
//!
//! A [`MemoryNetwork`] stands in for a network address: servers listen on it,
//! clients dial it. Each dial produces a connected [`MemorySocket`] pair.
//!
//! Closing one end drops its sender, so the peer drains whatever was already
//! written and then reads [`ReadError::Closed`]. Dialing while nobody listens
//! fails with `Disconnected`, which makes server restarts easy to simulate.
//!
//! # Example
//!
//! ```
//! use bytes::{Bytes, BytesMut};
//! use wirelink::transport::{MemorySocket, Socket};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (a, b) = MemorySocket::pair();
//! a.write(Bytes::from_static(b"ping")).await.unwrap();
//! let mut buf = BytesMut::new();
//! b.read(&mut buf, None).await.unwrap();
//! assert_eq!(&buf[..], b"ping");
//! # }
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Accepted, ClientSocket, Listener, ReadError, Socket};
use crate::error::{Result, WireError};

/// One end of an in-process connection.
pub struct MemorySocket {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: CancellationToken,
    close_count: AtomicUsize,
    remote_addr: String,
}

impl MemorySocket {
    /// Create a connected pair of sockets.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_addrs("memory:a", "memory:b")
    }

    fn pair_with_addrs(a_addr: &str, b_addr: &str) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self::new(a_tx, a_rx, b_addr),
            Self::new(b_tx, b_rx, a_addr),
        )
    }

    fn new(
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
        remote_addr: &str,
    ) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
            close_count: AtomicUsize::new(0),
            remote_addr: remote_addr.to_string(),
        }
    }

    /// Number of times this end was actually closed (0 or 1).
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Socket for MemorySocket {
    async fn write(&self, frame: Bytes) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| WireError::Disconnected("socket closed".to_string()))?;
        tx.send(frame)
            .map_err(|_| WireError::Disconnected("peer closed".to_string()))
    }

    async fn read(
        &self,
        buf: &mut BytesMut,
        deadline: Option<Instant>,
    ) -> std::result::Result<(), ReadError> {
        if self.closed.is_cancelled() {
            return Err(ReadError::Closed);
        }
        let mut rx = tokio::select! {
            rx = self.rx.lock() => rx,
            _ = self.closed.cancelled() => return Err(ReadError::Closed),
        };
        let frame = match deadline {
            Some(deadline) => tokio::select! {
                frame = rx.recv() => frame,
                _ = self.closed.cancelled() => return Err(ReadError::Closed),
                _ = tokio::time::sleep_until(deadline) => return Err(ReadError::Timeout),
            },
            None => tokio::select! {
                frame = rx.recv() => frame,
                _ = self.closed.cancelled() => return Err(ReadError::Closed),
            },
        };
        match frame {
            Some(frame) => {
                buf.extend_from_slice(&frame);
                Ok(())
            }
            None => Err(ReadError::Closed),
        }
    }

    async fn close(&self) {
        let Some(tx) = self.tx.lock().take() else {
            return;
        };
        drop(tx);
        self.close_count.fetch_add(1, Ordering::AcqRel);
        self.closed.cancel();
        // Refuse further frames from the peer.
        self.rx.lock().await.close();
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.clone())
    }

    fn is_connected(&self) -> bool {
        match &*self.tx.lock() {
            Some(tx) => !tx.is_closed(),
            None => false,
        }
    }
}

impl std::fmt::Debug for MemorySocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySocket")
            .field("remote_addr", &self.remote_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

struct NetworkInner {
    listener: Mutex<Option<mpsc::UnboundedSender<Accepted>>>,
    next_port: AtomicU64,
}

/// An in-process network address.
///
/// Cheap to clone; clones refer to the same address.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Create an address nobody listens on yet.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                listener: Mutex::new(None),
                next_port: AtomicU64::new(1),
            }),
        }
    }

    /// Start listening, replacing any previous listener.
    pub fn listen(&self) -> MemoryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.listener.lock() = Some(tx);
        MemoryListener { rx }
    }

    /// Stop accepting new connections. Existing connections are unaffected.
    pub fn unlisten(&self) {
        self.inner.listener.lock().take();
    }

    /// Create a client socket dialing this address.
    pub fn client_socket(&self) -> MemoryClientSocket {
        MemoryClientSocket {
            network: self.clone(),
            current: RwLock::new(None),
            user_agent: None,
        }
    }

    fn connect(&self, user_agent: Option<String>) -> Result<MemorySocket> {
        let guard = self.inner.listener.lock();
        let listener = guard
            .as_ref()
            .ok_or_else(|| WireError::Disconnected("connection refused".to_string()))?;

        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let (client, server) =
            MemorySocket::pair_with_addrs(&format!("memory:{}", port), "memory:server");

        listener
            .send(Accepted {
                socket: Arc::new(server),
                user_agent,
            })
            .map_err(|_| WireError::Disconnected("connection refused".to_string()))?;
        Ok(client)
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("listening", &self.inner.listener.lock().is_some())
            .finish()
    }
}

/// Accepts sockets dialed on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<Accepted>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Result<Option<Accepted>> {
        Ok(self.rx.recv().await)
    }
}

/// A client socket that redials its [`MemoryNetwork`] on every `dial`.
pub struct MemoryClientSocket {
    network: MemoryNetwork,
    current: RwLock<Option<Arc<MemorySocket>>>,
    user_agent: Option<String>,
}

impl MemoryClientSocket {
    /// Report `user_agent` to the server on every dial.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    fn current(&self) -> Option<Arc<MemorySocket>> {
        self.current.read().clone()
    }
}

#[async_trait]
impl Socket for MemoryClientSocket {
    async fn write(&self, frame: Bytes) -> Result<()> {
        match self.current() {
            Some(socket) => socket.write(frame).await,
            None => Err(WireError::Disconnected("not dialed".to_string())),
        }
    }

    async fn read(
        &self,
        buf: &mut BytesMut,
        deadline: Option<Instant>,
    ) -> std::result::Result<(), ReadError> {
        match self.current() {
            Some(socket) => socket.read(buf, deadline).await,
            None => Err(ReadError::Closed),
        }
    }

    async fn close(&self) {
        if let Some(socket) = self.current() {
            socket.close().await;
        }
    }

    fn remote_addr(&self) -> Option<String> {
        self.current().and_then(|s| s.remote_addr())
    }

    fn is_connected(&self) -> bool {
        self.current().is_some_and(|s| s.is_connected())
    }
}

#[async_trait]
impl ClientSocket for MemoryClientSocket {
    async fn dial(&self, deadline: Instant) -> Result<()> {
        if Instant::now() >= deadline {
            return Err(WireError::Disconnected("dial deadline exceeded".to_string()));
        }
        let socket = Arc::new(self.network.connect(self.user_agent.clone())?);
        let previous = self.current.write().replace(socket);
        if let Some(previous) = previous {
            previous.close().await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryClientSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryClientSocket")
            .field("connected", &self.is_connected())
            .finish()
    }
}
