//! Client - dialing, reconnection, requests and signals.
//!
//! ```text
//!            connect() / supervisor
//! Disconnected ───────────────────► Connecting ──dial + handshake──► Connected
//!      ▲                                │ failure                        │
//!      └────────────────────────────────┴──── read loop ends / close() ◄─┘
//! ```
//!
//! Operations that need a connection wait for it when autoconnect is
//! enabled: the first one starts the background supervisor, and all of them
//! are released together when it succeeds or gives up.
//!
//! # Example
//!
//! ```ignore
//! use wirelink::client::{Client, ClientImplementation};
//! use wirelink::protocol::Payload;
//!
//! let client = Client::builder(Arc::new(Handler), Arc::new(network.client_socket()))
//!     .default_request_timeout(Duration::from_secs(5))
//!     .build()?;
//! client.connect().await?;
//! let reply = client.request("echo", Payload::utf8("hi")).await?;
//! assert_eq!(reply.payload_str()?, "hi");
//! ```

mod dial;
mod handle;
mod heartbeat;
mod options;
mod reconnect;
mod request_manager;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, WireError};
use crate::protocol::{
    build_close_session, build_request, build_restore_session, build_signal, BufferPool,
    Identifier, Message, Payload, DEFAULT_MAX_POOLED,
};
use crate::session::Session;
use crate::transport::ClientSocket;

use heartbeat::Heartbeat;
use reconnect::{Barrier, Dam};

pub use heartbeat::{run_heartbeat, HeartbeatResult};
pub use options::{
    Autoconnect, ClientOptions, DEFAULT_DIALING_TIMEOUT, DEFAULT_RECONNECTION_INTERVAL,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use request_manager::{PendingRequest, Reply, RequestManager};

/// Application hooks invoked by the client's read loop.
///
/// Hooks run on the read loop; a panic is logged and does not end it.
pub trait ClientImplementation: Send + Sync + 'static {
    /// The server created a session for this client.
    fn on_session_created(&self, session: &Session) {
        let _ = session;
    }

    /// The session was closed.
    fn on_session_closed(&self) {}

    /// The server pushed a signal. The message is released afterwards.
    fn on_signal(&self, msg: &Message) {
        let _ = msg;
    }
}

/// Implementation that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopClient;

impl ClientImplementation for NoopClient {}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No socket.
    Disconnected,
    /// Dialing or awaiting the handshake.
    Connecting,
    /// Handshake complete.
    Connected,
}

/// Runtime autoconnect policy. `Deactivated` is entered by `close` and left
/// by the next operation that needs a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AutoconnectState {
    Disabled = 0,
    Deactivated = 1,
    Enabled = 2,
}

impl From<u8> for AutoconnectState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Deactivated,
            2 => Self::Enabled,
            _ => Self::Disabled,
        }
    }
}

impl From<Autoconnect> for AutoconnectState {
    fn from(value: Autoconnect) -> Self {
        match value {
            Autoconnect::Enabled => Self::Enabled,
            Autoconnect::Disabled => Self::Disabled,
        }
    }
}

/// Lock-free cell holding an [`AutoconnectState`].
#[derive(Debug)]
struct AutoconnectCell(AtomicU8);

impl AutoconnectCell {
    fn new(state: AutoconnectState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> AutoconnectState {
        AutoconnectState::from(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`. Returns false if the state was not `from`.
    fn transition(&self, from: AutoconnectState, to: AutoconnectState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn reactivate(&self) -> bool {
        self.transition(AutoconnectState::Deactivated, AutoconnectState::Enabled)
    }
}

/// Deadline and cancellation for one operation.
#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    /// Overrides `default_request_timeout`.
    pub timeout: Option<Duration>,
    /// Cancels the wait when fired.
    pub cancel: Option<CancellationToken>,
}

impl RequestScope {
    /// Scope with a timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    /// Scope cancelled by `token`.
    pub fn with_cancel(token: CancellationToken) -> Self {
        Self {
            timeout: None,
            cancel: Some(token),
        }
    }
}

#[derive(Debug)]
struct Link {
    status: Status,
    generation: u64,
    reader: Option<CancellationToken>,
}

/// State shared by the client handle, its read loop, heartbeat and
/// supervisor.
pub(crate) struct ClientInner {
    options: ClientOptions,
    implementation: Arc<dyn ClientImplementation>,
    socket: Arc<dyn ClientSocket>,
    buffer_pool: BufferPool,
    requests: RequestManager,
    heartbeat: Heartbeat,
    dam: Dam,
    link: Mutex<Link>,
    autoconnect: AutoconnectCell,
    session: RwLock<Option<Session>>,
    // Serializes dial attempts from connect() and the supervisor.
    connect_lock: tokio::sync::Mutex<()>,
}

impl ClientInner {
    fn status(&self) -> Status {
        self.link.lock().status
    }

    fn autoconnect_enabled(&self) -> bool {
        self.autoconnect.load() == AutoconnectState::Enabled
    }

    /// Dial and handshake unless already connected, then restore the
    /// previous session if there was one.
    async fn connect(self: &Arc<Self>) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        {
            let mut link = self.link.lock();
            if link.status == Status::Connected {
                return Ok(());
            }
            link.status = Status::Connecting;
        }

        let conf = match dial::dial(self.socket.as_ref(), &self.options, &self.buffer_pool).await {
            Ok(conf) => conf,
            Err(e) => {
                self.link.lock().status = Status::Disconnected;
                return Err(e);
            }
        };

        let (generation, stop) = {
            let mut link = self.link.lock();
            link.generation += 1;
            link.status = Status::Connected;
            let stop = CancellationToken::new();
            link.reader = Some(stop.clone());
            (link.generation, stop)
        };
        tokio::spawn(handle::read_loop(self.clone(), generation, stop));

        if self.options.heartbeat && conf.read_timeout_ms > 0 {
            let interval = Duration::from_millis(u64::from(conf.read_timeout_ms) / 2);
            self.heartbeat.start(self.socket.clone(), interval);
        }
        info!("connected to {:?}", self.socket.remote_addr());

        let previous = self.session.read().as_ref().map(|s| s.key.clone());
        if let Some(key) = previous {
            let deadline = Instant::now() + self.options.default_request_timeout;
            if let Err(e) = self.restore_session(&key, deadline, None).await {
                warn!("failed restoring session after reconnect: {}", e);
                if matches!(e, WireError::SessionNotFound) {
                    self.session.write().take();
                }
            }
        }
        Ok(())
    }

    /// Tear down connection `generation`. Returns false if it was already
    /// torn down or superseded.
    async fn teardown(&self, generation: u64, reason: &str) -> bool {
        let reader = {
            let mut link = self.link.lock();
            if link.generation != generation {
                return false;
            }
            match link.reader.take() {
                Some(reader) => reader,
                None => return false,
            }
        };

        // Status stays Connected until the socket is closed so no new dial
        // can slip in and get closed by us.
        reader.cancel();
        self.heartbeat.stop();
        self.socket.close().await;
        self.link.lock().status = Status::Disconnected;

        self.requests
            .fail_all(WireError::Disconnected(reason.to_string()));
        debug!("connection {} torn down: {}", generation, reason);
        true
    }

    /// Join the reconnection cycle, starting the supervisor if needed.
    fn start_reconnect(self: &Arc<Self>) -> Arc<Barrier> {
        let (barrier, start) = self.dam.join();
        if start {
            tokio::spawn(reconnect::supervise(self.clone()));
        }
        barrier
    }

    /// Make sure a connection exists, waiting for the supervisor if
    /// autoconnect allows it.
    async fn ensure_connected(
        self: &Arc<Self>,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        self.autoconnect.reactivate();
        if self.status() == Status::Connected {
            return Ok(());
        }
        if !self.autoconnect_enabled() {
            return Err(WireError::Disconnected(
                "not connected and autoconnect is disabled".to_string(),
            ));
        }

        let barrier = self.start_reconnect();
        let canceled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            outcome = barrier.wait() => outcome,
            () = tokio::time::sleep_until(deadline) => Err(WireError::Timeout),
            () = canceled => Err(WireError::Canceled),
        }
    }

    /// Write a frame and restart the heartbeat countdown.
    async fn send(&self, frame: Bytes) -> Result<()> {
        self.socket.write(frame).await?;
        self.heartbeat.reset();
        Ok(())
    }

    /// Send a request frame built for a fresh identifier and await its reply.
    async fn roundtrip(
        &self,
        frame: impl FnOnce(Identifier) -> Result<Bytes>,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Result<Message> {
        let pending = self.requests.create();
        let frame = frame(pending.identifier())?;
        self.send(frame).await?;
        pending.await_reply(Some(deadline), cancel).await
    }

    async fn restore_session(
        &self,
        key: &str,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let msg = self
            .roundtrip(
                |id| Ok(build_restore_session(id, key.as_bytes())),
                deadline,
                cancel,
            )
            .await?;
        let session = Session::from_json(msg.payload());
        msg.release();
        *self.session.write() = Some(session?);
        debug!("session restored");
        Ok(())
    }

    fn clear_session(&self) {
        let taken = self.session.write().take();
        if taken.is_some() {
            handle::guarded("on_session_closed", || {
                self.implementation.on_session_closed()
            });
        }
    }
}

/// Builder for configuring and creating a [`Client`].
pub struct ClientBuilder {
    implementation: Arc<dyn ClientImplementation>,
    socket: Arc<dyn ClientSocket>,
    options: ClientOptions,
}

impl ClientBuilder {
    /// Create a builder with default options.
    pub fn new(implementation: Arc<dyn ClientImplementation>, socket: Arc<dyn ClientSocket>) -> Self {
        Self {
            implementation,
            socket,
            options: ClientOptions::default(),
        }
    }

    /// Replace all options at once (e.g. loaded from JSON).
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Deadline for dial and handshake.
    ///
    /// Default: 5 seconds
    pub fn dialing_timeout(mut self, timeout: Duration) -> Self {
        self.options.dialing_timeout = timeout;
        self
    }

    /// Deadline for requests without an explicit timeout.
    ///
    /// Default: 60 seconds
    pub fn default_request_timeout(mut self, timeout: Duration) -> Self {
        self.options.default_request_timeout = timeout;
        self
    }

    /// Pause between reconnection attempts.
    ///
    /// Default: 2 seconds
    pub fn reconnection_interval(mut self, interval: Duration) -> Self {
        self.options.reconnection_interval = interval;
        self
    }

    /// Automatic reconnection policy.
    ///
    /// Default: enabled
    pub fn autoconnect(mut self, autoconnect: Autoconnect) -> Self {
        self.options.autoconnect = autoconnect;
        self
    }

    /// Message buffer size; must equal the server's.
    ///
    /// Default: 8192
    pub fn message_buffer_size(mut self, size: u32) -> Self {
        self.options.message_buffer_size = size;
        self
    }

    /// Sub-protocol name; must equal the server's.
    pub fn sub_protocol_name(mut self, name: impl Into<String>) -> Self {
        self.options.sub_protocol_name = Some(name.into());
        self
    }

    /// Enable or disable heartbeats.
    ///
    /// Default: enabled
    pub fn heartbeat(mut self, enabled: bool) -> Self {
        self.options.heartbeat = enabled;
        self
    }

    /// Validate the options and create the client. Does not dial.
    pub fn build(self) -> Result<Client> {
        self.options.prepare()?;
        let autoconnect = AutoconnectCell::new(self.options.autoconnect.into());
        let inner = ClientInner {
            buffer_pool: BufferPool::new(
                self.options.message_buffer_size as usize,
                DEFAULT_MAX_POOLED,
            ),
            options: self.options,
            implementation: self.implementation,
            socket: self.socket,
            requests: RequestManager::new(),
            heartbeat: Heartbeat::new(),
            dam: Dam::new(),
            link: Mutex::new(Link {
                status: Status::Disconnected,
                generation: 0,
                reader: None,
            }),
            autoconnect,
            session: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        };
        Ok(Client {
            inner: Arc::new(inner),
        })
    }
}

/// A client handle. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a builder.
    pub fn builder(
        implementation: Arc<dyn ClientImplementation>,
        socket: Arc<dyn ClientSocket>,
    ) -> ClientBuilder {
        ClientBuilder::new(implementation, socket)
    }

    /// Options in effect.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Current connection state.
    pub fn status(&self) -> Status {
        self.inner.status()
    }

    /// Number of requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.requests.pending_count()
    }

    /// Connect now. Reactivates autoconnect if `close` deactivated it.
    ///
    /// # Errors
    ///
    /// `Disconnected` if the server is unreachable or the handshake timed
    /// out; a handshake mismatch error if the configurations disagree.
    pub async fn connect(&self) -> Result<()> {
        self.inner.autoconnect.reactivate();
        self.inner.connect().await
    }

    /// Close the connection and suppress autoconnect until the next
    /// operation that needs a connection. Pending requests fail with
    /// `Disconnected`.
    pub async fn close(&self) {
        self.inner
            .autoconnect
            .transition(AutoconnectState::Enabled, AutoconnectState::Deactivated);
        let generation = self.inner.link.lock().generation;
        self.inner.teardown(generation, "closed by client").await;
    }

    /// Send a request with the default timeout.
    pub async fn request(&self, name: &str, payload: Payload) -> Result<Reply> {
        self.request_with(name, payload, RequestScope::default())
            .await
    }

    /// Send a request and await its reply within `scope`.
    ///
    /// The deadline covers waiting for a connection as well as the reply.
    ///
    /// # Errors
    ///
    /// - `ProtocolViolation` if both `name` and `payload` are empty
    /// - `Timeout` / `Canceled` per `scope`
    /// - `Request { code, message }` when the server's handler rejected it
    /// - `Internal`, `ServerShutdown` and the session errors as replied
    /// - `Disconnected` if the connection dropped before the reply
    pub async fn request_with(
        &self,
        name: &str,
        payload: Payload,
        scope: RequestScope,
    ) -> Result<Reply> {
        let name = (!name.is_empty()).then(|| name.as_bytes());
        if name.is_none() && payload.is_empty() {
            return Err(WireError::ProtocolViolation(
                "request requires a name or a payload".to_string(),
            ));
        }

        let deadline = self.deadline(&scope);
        let cancel = scope.cancel.as_ref();
        self.inner.ensure_connected(deadline, cancel).await?;
        let msg = self
            .inner
            .roundtrip(|id| build_request(id, name, &payload), deadline, cancel)
            .await?;
        Ok(Reply::new(msg))
    }

    /// Send a signal to the server. No reply is expected.
    pub async fn signal(&self, name: &str, payload: Payload) -> Result<()> {
        let name = (!name.is_empty()).then(|| name.as_bytes());
        let frame = build_signal(name, &payload)?;
        let deadline = self.deadline(&RequestScope::default());
        self.inner.ensure_connected(deadline, None).await?;
        self.inner.send(frame).await
    }

    /// Attach the session identified by `key`.
    ///
    /// # Errors
    ///
    /// `SessionConflict` if a session is already attached locally, otherwise
    /// the server's answer (`SessionNotFound`, `SessionsDisabled`,
    /// `MaxSessionConnectionsReached`, ...).
    pub async fn restore_session(&self, key: &str) -> Result<()> {
        if self.inner.session.read().is_some() {
            return Err(WireError::SessionConflict(
                "a session is already active".to_string(),
            ));
        }
        let deadline = self.deadline(&RequestScope::default());
        self.inner.ensure_connected(deadline, None).await?;
        self.inner.restore_session(key, deadline, None).await
    }

    /// Close the current session. Without a connection only the local
    /// session is dropped.
    pub async fn close_session(&self) -> Result<()> {
        if self.inner.session.read().is_none() {
            return Ok(());
        }
        if self.status() != Status::Connected {
            self.inner.clear_session();
            return Ok(());
        }

        let deadline = self.deadline(&RequestScope::default());
        let reply = self
            .inner
            .roundtrip(|id| Ok(build_close_session(id)), deadline, None)
            .await?;
        reply.release();
        self.inner.clear_session();
        Ok(())
    }

    /// Copy of the current session.
    pub fn session(&self) -> Option<Session> {
        self.inner.session.read().clone()
    }

    /// Key of the current session.
    pub fn session_key(&self) -> Option<String> {
        self.inner.session.read().as_ref().map(|s| s.key.clone())
    }

    /// A field of the current session's info.
    pub fn session_info(&self, field: &str) -> Option<Value> {
        self.inner
            .session
            .read()
            .as_ref()
            .and_then(|s| s.info_value(field))
    }

    fn deadline(&self, scope: &RequestScope) -> Instant {
        Instant::now()
            + scope
                .timeout
                .unwrap_or(self.inner.options.default_request_timeout)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("status", &self.status())
            .field("pending_requests", &self.pending_requests())
            .field("session", &self.session_key())
            .finish()
    }
}
