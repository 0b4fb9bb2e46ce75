//! Server - accept loop, per-connection dispatch and graceful shutdown.
//!
//! The [`ServerBuilder`] configures options and hooks; the [`Server`] accepts
//! sockets from any [`Listener`] and serves each one:
//! 1. Ask `before_accept` whether to serve the client
//! 2. Send the accept-configuration handshake
//! 3. Read frames and dispatch requests and signals to the implementation
//! 4. Tear the connection down once it is closed and its handlers are done
//!
//! # Example
//!
//! ```ignore
//! use wirelink::server::{Server, ServerImplementation};
//!
//! let server = Server::builder(Arc::new(EchoServer))
//!     .read_timeout(Duration::from_secs(30))
//!     .build()?;
//! let listener = network.listen();
//! tokio::spawn({
//!     let server = server.clone();
//!     async move { server.run(listener).await }
//! });
//! // ...
//! server.shutdown().await;
//! ```

mod connection;
mod context;
mod dispatch;
mod options;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::error::{Result, WireError};
use crate::protocol::{BufferPool, Message, Payload, DEFAULT_MAX_POOLED};
use crate::session::{
    MemorySessionManager, RandomKeyGenerator, SessionKeyGenerator, SessionManager,
    SessionRegistry,
};
use crate::transport::{Accepted, Listener};

pub use connection::{ClientInfo, Connection, ConnectionId};
pub use context::RequestContext;
pub use options::{
    Acceptance, ConnectionOptions, ServerOptions, DEFAULT_MESSAGE_BUFFER_SIZE,
    DEFAULT_READ_TIMEOUT, MIN_MESSAGE_BUFFER_SIZE,
};

/// Application hooks invoked by the server.
///
/// Exactly one of `on_request`/`on_signal` runs per inbound request or
/// signal frame, inside the connection's admission bracket. The message is
/// released after the hook returns.
#[async_trait]
pub trait ServerImplementation: Send + Sync + 'static {
    /// Handle a request and produce the reply payload.
    ///
    /// Return `WireError::Request` to send an error reply carrying a code and
    /// message. Any other error is reported to the client as an internal
    /// error without details.
    async fn on_request(
        &self,
        ctx: RequestContext,
        conn: &Arc<Connection>,
        msg: &Message,
    ) -> Result<Payload>;

    /// Handle a signal from the client.
    async fn on_signal(&self, ctx: RequestContext, conn: &Arc<Connection>, msg: &Message) {
        let _ = (ctx, conn, msg);
    }

    /// A client completed the handshake.
    async fn on_client_connected(&self, options: &ConnectionOptions, conn: &Arc<Connection>) {
        let _ = (options, conn);
    }

    /// A client's read loop ended. `reason` is `None` on a clean close.
    async fn on_client_disconnected(&self, conn: &Arc<Connection>, reason: Option<&WireError>) {
        let _ = (conn, reason);
    }

    /// Decide whether and how to serve a new client.
    fn before_accept(&self, info: &ClientInfo) -> ConnectionOptions {
        let _ = info;
        ConnectionOptions::default()
    }
}

/// State shared by the server handle and all its connections.
pub(crate) struct ServerCore {
    pub(crate) options: ServerOptions,
    pub(crate) implementation: Arc<dyn ServerImplementation>,
    pub(crate) session_manager: Arc<dyn SessionManager>,
    pub(crate) key_generator: Arc<dyn SessionKeyGenerator>,
    pub(crate) registry: SessionRegistry,
    pub(crate) buffer_pool: BufferPool,
    pub(crate) shutdown: CancellationToken,
    /// Request and signal handler tasks.
    pub(crate) handlers: TaskTracker,
    /// Per-connection read loops.
    pub(crate) serving: TaskTracker,
    pub(crate) connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    next_connection_id: AtomicU64,
}

impl ServerCore {
    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Builder for configuring and creating a [`Server`].
pub struct ServerBuilder {
    implementation: Arc<dyn ServerImplementation>,
    options: ServerOptions,
    session_manager: Option<Arc<dyn SessionManager>>,
    key_generator: Option<Arc<dyn SessionKeyGenerator>>,
}

impl ServerBuilder {
    /// Create a builder with default options.
    pub fn new(implementation: Arc<dyn ServerImplementation>) -> Self {
        Self {
            implementation,
            options: ServerOptions::default(),
            session_manager: None,
            key_generator: None,
        }
    }

    /// Replace all options at once (e.g. loaded from JSON).
    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Enable or disable sessions.
    ///
    /// Default: enabled
    pub fn sessions_enabled(mut self, enabled: bool) -> Self {
        self.options.sessions_enabled = enabled;
        self
    }

    /// Maximum connections sharing one session (0 = unlimited).
    ///
    /// Default: 0
    pub fn max_session_connections(mut self, max: usize) -> Self {
        self.options.max_session_connections = max;
        self
    }

    /// Message buffer size clients must match.
    ///
    /// Default: 8192
    pub fn message_buffer_size(mut self, size: u32) -> Self {
        self.options.message_buffer_size = size;
        self
    }

    /// Sub-protocol name clients must match.
    pub fn sub_protocol_name(mut self, name: impl Into<String>) -> Self {
        self.options.sub_protocol_name = Some(name.into());
        self
    }

    /// Read deadline per frame.
    ///
    /// Default: 60 seconds
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.options.read_timeout = timeout;
        self
    }

    /// Concurrent handlers per connection.
    ///
    /// Default: 256
    pub fn default_concurrency_limit(mut self, limit: usize) -> Self {
        self.options.default_concurrency_limit = limit;
        self
    }

    /// Session lifecycle hooks.
    ///
    /// Default: [`MemorySessionManager`]
    pub fn session_manager(mut self, manager: Arc<dyn SessionManager>) -> Self {
        self.session_manager = Some(manager);
        self
    }

    /// Session key generator.
    ///
    /// Default: [`RandomKeyGenerator`]
    pub fn key_generator(mut self, generator: Arc<dyn SessionKeyGenerator>) -> Self {
        self.key_generator = Some(generator);
        self
    }

    /// Validate the options and create the server.
    pub fn build(self) -> Result<Server> {
        self.options.prepare()?;
        let core = ServerCore {
            registry: SessionRegistry::new(self.options.max_session_connections),
            buffer_pool: BufferPool::new(
                self.options.message_buffer_size as usize,
                DEFAULT_MAX_POOLED,
            ),
            options: self.options,
            implementation: self.implementation,
            session_manager: self
                .session_manager
                .unwrap_or_else(|| Arc::new(MemorySessionManager::new())),
            key_generator: self
                .key_generator
                .unwrap_or_else(|| Arc::new(RandomKeyGenerator)),
            shutdown: CancellationToken::new(),
            handlers: TaskTracker::new(),
            serving: TaskTracker::new(),
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        };
        Ok(Server {
            core: Arc::new(core),
        })
    }
}

/// A running server. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    core: Arc<ServerCore>,
}

impl Server {
    /// Create a builder.
    pub fn builder(implementation: Arc<dyn ServerImplementation>) -> ServerBuilder {
        ServerBuilder::new(implementation)
    }

    /// Options in effect.
    pub fn options(&self) -> &ServerOptions {
        &self.core.options
    }

    /// Accept sockets until the listener closes or the server shuts down.
    pub async fn run<L: Listener>(&self, mut listener: L) -> Result<()> {
        info!("server accepting connections");
        loop {
            let accepted = tokio::select! {
                _ = self.core.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            match accepted {
                Some(accepted) => self.handle_connection(accepted),
                None => break,
            }
        }
        debug!("accept loop stopped");
        Ok(())
    }

    /// Serve a single accepted socket in the background.
    pub fn handle_connection(&self, accepted: Accepted) {
        let core = self.core.clone();
        self.core
            .serving
            .spawn(async move { dispatch::serve(core, accepted).await });
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.core.connections.lock().len()
    }

    /// Snapshot of live connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.core.connections.lock().values().cloned().collect()
    }

    /// Connections sharing the session `key`.
    pub fn session_connections(&self, key: &str) -> Vec<Arc<Connection>> {
        self.core.registry.session_connections(key)
    }

    /// Number of sessions with at least one live connection.
    pub fn active_session_count(&self) -> usize {
        self.core.registry.len()
    }

    /// Check if `shutdown` was called.
    pub fn is_shutting_down(&self) -> bool {
        self.core.is_shutting_down()
    }

    /// Shut down gracefully.
    ///
    /// Stops accepting, answers new requests with a shutdown reply, waits for
    /// running handlers and then closes every connection.
    pub async fn shutdown(&self) {
        info!("server shutting down");
        self.core.shutdown.cancel();

        self.core.handlers.close();
        self.core.handlers.wait().await;

        for conn in self.connections() {
            conn.close().await;
        }

        self.core.serving.close();
        self.core.serving.wait().await;
        debug!("server shut down");
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("options", &self.core.options)
            .field("connections", &self.connection_count())
            .finish()
    }
}
