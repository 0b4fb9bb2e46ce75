//! Server-side connection lifecycle and task accounting.
//!
//! A connection is torn down ("unlinked") only once both of these hold:
//!
//! ```text
//!   close() called ──► is_active = false ─┐
//!                                         ├──► unlink (exactly once)
//!   last handler ends ──► tasks = 0 ──────┘       │
//!                                                 ├─ deregister session (no destroy)
//!                                                 ├─ cancel handler contexts
//!                                                 └─ close socket
//! ```
//!
//! Both conditions are checked under the same lock, so whichever side
//! observes the second one performs the unlink.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::options::ConnectionOptions;
use super::ServerCore;
use crate::admission::AdmissionController;
use crate::error::{Result, WireError};
use crate::protocol::{build_session_closed, build_session_created, build_signal, Payload};
use crate::session::{Deregistration, Session, SessionInfo};
use crate::transport::Socket;

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Metadata about the connected client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// When the socket was accepted.
    pub connection_time: DateTime<Utc>,
    /// Remote address reported by the transport.
    pub remote_addr: Option<String>,
    /// User agent reported by the transport.
    pub user_agent: Option<String>,
}

#[derive(Debug, Default)]
struct TaskState {
    is_active: bool,
    tasks: usize,
    unlinked: bool,
}

/// One client connection as seen by the server.
pub struct Connection {
    id: ConnectionId,
    socket: Arc<dyn Socket>,
    core: Arc<ServerCore>,
    info: ClientInfo,
    options: ConnectionOptions,
    admission: AdmissionController,
    state: Mutex<TaskState>,
    session: RwLock<Option<Session>>,
    // Serializes create/restore/close so two of them never interleave.
    session_op: tokio::sync::Mutex<()>,
    closed: CancellationToken,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        socket: Arc<dyn Socket>,
        core: Arc<ServerCore>,
        info: ClientInfo,
        options: ConnectionOptions,
    ) -> Self {
        let limit = options
            .concurrency_limit
            .unwrap_or(core.options.default_concurrency_limit);
        Self {
            id,
            socket,
            core,
            info,
            options,
            admission: AdmissionController::new(limit),
            state: Mutex::new(TaskState {
                is_active: true,
                ..Default::default()
            }),
            session: RwLock::new(None),
            session_op: tokio::sync::Mutex::new(()),
            closed: CancellationToken::new(),
        }
    }

    /// Connection identifier.
    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Client metadata.
    #[inline]
    pub fn info(&self) -> &ClientInfo {
        &self.info
    }

    /// Remote address of the client.
    pub fn remote_addr(&self) -> Option<&str> {
        self.info.remote_addr.as_deref()
    }

    /// User agent of the client.
    pub fn user_agent(&self) -> Option<&str> {
        self.info.user_agent.as_deref()
    }

    /// When the connection was accepted.
    pub fn creation(&self) -> DateTime<Utc> {
        self.info.connection_time
    }

    /// Options chosen for this connection.
    #[inline]
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub(crate) fn socket(&self) -> &Arc<dyn Socket> {
        &self.socket
    }

    pub(crate) fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub(crate) fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }

    /// Check if `close()` has not been called yet and the socket is alive.
    pub fn is_active(&self) -> bool {
        self.state.lock().is_active && self.socket.is_connected()
    }

    /// Number of handlers currently running for this connection.
    pub fn pending_tasks(&self) -> usize {
        self.state.lock().tasks
    }

    /// Check if the connection was fully torn down.
    pub fn is_unlinked(&self) -> bool {
        self.state.lock().unlinked
    }

    /// Push a signal to the client.
    ///
    /// Failures are logged and returned; they never close the connection.
    pub async fn signal(&self, name: Option<&[u8]>, payload: Payload) -> Result<()> {
        let frame = build_signal(name, &payload)?;
        self.socket.write(frame).await.map_err(|e| {
            warn!("failed sending signal to {}: {}", self.id, e);
            e
        })
    }

    /// Check if a session is attached.
    pub fn has_session(&self) -> bool {
        self.session.read().is_some()
    }

    /// Copy of the attached session.
    pub fn session(&self) -> Option<Session> {
        self.session.read().clone()
    }

    /// Key of the attached session.
    pub fn session_key(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.key.clone())
    }

    /// A field of the attached session's info.
    pub fn session_info(&self, field: &str) -> Option<Value> {
        self.session
            .read()
            .as_ref()
            .and_then(|s| s.info_value(field))
    }

    /// Create a session for this connection and announce it to the client.
    ///
    /// # Errors
    ///
    /// - `SessionsDisabled` if the server has sessions turned off
    /// - `Disconnected` if the connection is gone
    /// - `SessionConflict` if a session is already attached
    /// - the write error if the notification cannot be sent
    pub async fn create_session(
        self: &Arc<Self>,
        info: Option<Arc<dyn SessionInfo>>,
    ) -> Result<()> {
        if !self.core.options.sessions_enabled {
            return Err(WireError::SessionsDisabled);
        }
        if !self.is_active() {
            return Err(WireError::Disconnected(format!("{} is closed", self.id)));
        }

        let _op = self.session_op.lock().await;
        if let Some(existing) = self.session_key() {
            return Err(WireError::SessionConflict(format!(
                "session {} is already active on {}",
                existing, self.id
            )));
        }

        let session = Session::new(self.core.key_generator.generate(), info);
        let encoded = session.to_json()?;
        self.socket
            .write(build_session_created(&encoded))
            .await?;

        self.core.registry.register(self.id, self, &session)?;
        *self.session.write() = Some(session);
        debug!("session created on {}", self.id);

        if let Err(e) = self.core.session_manager.on_session_created(self).await {
            warn!("session manager rejected new session on {}: {}", self.id, e);
        }
        Ok(())
    }

    /// Attach an existing session identified by `key`.
    ///
    /// Looks the key up among live sessions first, then asks the session
    /// manager.
    pub async fn restore_session(self: &Arc<Self>, key: &str) -> Result<Session> {
        if !self.core.options.sessions_enabled {
            return Err(WireError::SessionsDisabled);
        }

        let _op = self.session_op.lock().await;
        if self.has_session() {
            return Err(WireError::SessionConflict(format!(
                "a session is already active on {}",
                self.id
            )));
        }
        if !self.core.registry.has_capacity(key) {
            return Err(WireError::MaxSessionConnectionsReached);
        }

        let mut session = match self.core.registry.lookup(key) {
            Some(session) => session,
            None => self
                .core
                .session_manager
                .on_session_lookup(key)
                .await?
                .ok_or(WireError::SessionNotFound)?,
        };
        session.last_lookup = Utc::now();

        self.core.registry.register(self.id, self, &session)?;
        *self.session.write() = Some(session.clone());
        debug!("session restored on {}", self.id);
        Ok(session)
    }

    /// Close the attached session and notify the client. No-op without a
    /// session.
    ///
    /// The session is destroyed once no other connection shares it.
    pub async fn close_session(&self) -> Result<()> {
        if !self.core.options.sessions_enabled {
            return Err(WireError::SessionsDisabled);
        }

        let _op = self.session_op.lock().await;
        let taken = self.session.write().take();
        let Some(session) = taken else {
            return Ok(());
        };

        if let Deregistration::Removed { destroyed: true } =
            self.core.registry.deregister(self.id, &session.key, true)
        {
            if let Err(e) = self.core.session_manager.on_session_closed(&session.key).await {
                warn!("session manager failed closing session: {}", e);
            }
        }

        self.socket.write(build_session_closed()).await
    }

    /// Mark the start of a handler invocation.
    pub(crate) fn register_task(&self) {
        self.state.lock().tasks += 1;
    }

    /// Mark the end of a handler invocation. The last one after `close()`
    /// unlinks the connection.
    pub(crate) async fn deregister_task(&self) {
        let unlink = {
            let mut state = self.state.lock();
            if state.tasks == 0 {
                warn!("task deregistered on {} without a matching register", self.id);
                return;
            }
            state.tasks -= 1;
            Self::claim_unlink(&mut state)
        };
        if unlink {
            self.unlink().await;
        }
    }

    /// Stop serving this connection.
    ///
    /// Running handlers finish first; the socket is closed when the last
    /// one returns.
    pub async fn close(&self) {
        let unlink = {
            let mut state = self.state.lock();
            state.is_active = false;
            Self::claim_unlink(&mut state)
        };
        if unlink {
            self.unlink().await;
        }
    }

    fn claim_unlink(state: &mut TaskState) -> bool {
        if state.is_active || state.tasks > 0 || state.unlinked {
            return false;
        }
        state.unlinked = true;
        true
    }

    async fn unlink(&self) {
        let key = self.session.write().take().map(|s| s.key);
        if let Some(key) = key {
            self.core.registry.deregister(self.id, &key, false);
        }
        self.closed.cancel();
        self.admission.close();
        self.socket.close().await;
        self.core.connections.lock().remove(&self.id);
        debug!("{} unlinked", self.id);
    }

    /// Send raw frame bytes. Used for replies.
    pub(crate) async fn write(&self, frame: Bytes) -> Result<()> {
        self.socket.write(frame).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.info.remote_addr)
            .field("session", &self.session_key())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::{core, core_with, TestImplementation};
    use crate::server::ServerOptions;
    use crate::transport::MemorySocket;
    use bytes::BytesMut;
    use proptest::prelude::*;

    fn connection(core: &Arc<ServerCore>) -> (Arc<Connection>, Arc<MemorySocket>, MemorySocket) {
        let (server_end, client_end) = MemorySocket::pair();
        let server_end = Arc::new(server_end);
        let conn = Arc::new(Connection::new(
            ConnectionId(core.next_connection_id()),
            server_end.clone(),
            core.clone(),
            ClientInfo {
                connection_time: Utc::now(),
                remote_addr: Some("memory:test".to_string()),
                user_agent: None,
            },
            ConnectionOptions::default(),
        ));
        core.connections.lock().insert(conn.id(), conn.clone());
        (conn, server_end, client_end)
    }

    #[tokio::test]
    async fn test_close_without_tasks_unlinks_immediately() {
        let core = core(Arc::new(TestImplementation));
        let (conn, socket, _client) = connection(&core);

        conn.close().await;
        assert!(conn.is_unlinked());
        assert_eq!(socket.close_count(), 1);
        assert!(core.connections.lock().is_empty());
    }

    #[tokio::test]
    async fn test_close_waits_for_last_task() {
        let core = core(Arc::new(TestImplementation));
        let (conn, socket, _client) = connection(&core);

        conn.register_task();
        conn.register_task();
        conn.close().await;
        assert!(!conn.is_unlinked());
        assert_eq!(socket.close_count(), 0);

        conn.deregister_task().await;
        assert!(!conn.is_unlinked());
        conn.deregister_task().await;
        assert!(conn.is_unlinked());
        assert_eq!(socket.close_count(), 1);
    }

    #[tokio::test]
    async fn test_deregister_without_register_does_not_underflow() {
        let core = core(Arc::new(TestImplementation));
        let (conn, _socket, _client) = connection(&core);
        conn.deregister_task().await;
        assert_eq!(conn.pending_tasks(), 0);
        assert!(!conn.is_unlinked());
    }

    #[tokio::test]
    async fn test_create_session_notifies_client() {
        let core = core(Arc::new(TestImplementation));
        let (conn, _socket, client) = connection(&core);

        conn.create_session(None).await.unwrap();
        let key = conn.session_key().unwrap();
        assert!(core.registry.contains(&key));

        let mut buf = BytesMut::new();
        client.read(&mut buf, None).await.unwrap();
        assert_eq!(buf[0], crate::protocol::MessageType::NotifySessionCreated.as_byte());
        let announced = Session::from_json(&buf[1..]).unwrap();
        assert_eq!(announced.key, key);
    }

    #[tokio::test]
    async fn test_create_session_twice_conflicts() {
        let core = core(Arc::new(TestImplementation));
        let (conn, _socket, _client) = connection(&core);
        conn.create_session(None).await.unwrap();
        assert!(matches!(
            conn.create_session(None).await,
            Err(WireError::SessionConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_create_session_when_disabled() {
        let core = core_with(
            Arc::new(TestImplementation),
            ServerOptions {
                sessions_enabled: false,
                ..Default::default()
            },
        );
        let (conn, _socket, _client) = connection(&core);
        assert!(matches!(
            conn.create_session(None).await,
            Err(WireError::SessionsDisabled)
        ));
    }

    #[tokio::test]
    async fn test_create_session_on_closed_connection() {
        let core = core(Arc::new(TestImplementation));
        let (conn, _socket, _client) = connection(&core);
        conn.close().await;
        assert!(matches!(
            conn.create_session(None).await,
            Err(WireError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_shared_session_close_keeps_entry() {
        let core = core(Arc::new(TestImplementation));
        let (a, _sa, _ca) = connection(&core);
        let (b, _sb, _cb) = connection(&core);

        a.create_session(None).await.unwrap();
        let key = a.session_key().unwrap();
        b.restore_session(&key).await.unwrap();
        assert_eq!(core.registry.connection_count(&key), 2);

        a.close_session().await.unwrap();
        assert!(!a.has_session());
        assert!(core.registry.contains(&key));
        assert_eq!(core.registry.connection_count(&key), 1);

        b.close_session().await.unwrap();
        assert!(!core.registry.contains(&key));
        // Destroyed sessions are not restorable.
        let (c, _sc, _cc) = connection(&core);
        assert!(matches!(
            c.restore_session(&key).await,
            Err(WireError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn test_unlink_keeps_session_restorable() {
        let core = core(Arc::new(TestImplementation));
        let (a, _sa, _ca) = connection(&core);
        a.create_session(None).await.unwrap();
        let key = a.session_key().unwrap();

        a.close().await;
        assert!(!core.registry.contains(&key));

        let (b, _sb, _cb) = connection(&core);
        let restored = b.restore_session(&key).await.unwrap();
        assert_eq!(restored.key, key);
    }

    #[tokio::test]
    async fn test_restore_respects_connection_limit() {
        let core = core_with(
            Arc::new(TestImplementation),
            ServerOptions {
                max_session_connections: 1,
                ..Default::default()
            },
        );
        let (a, _sa, _ca) = connection(&core);
        let (b, _sb, _cb) = connection(&core);
        a.create_session(None).await.unwrap();
        let key = a.session_key().unwrap();
        assert!(matches!(
            b.restore_session(&key).await,
            Err(WireError::MaxSessionConnectionsReached)
        ));
    }

    #[tokio::test]
    async fn test_close_session_without_session_is_noop() {
        let core = core(Arc::new(TestImplementation));
        let (conn, _socket, client) = connection(&core);
        conn.close_session().await.unwrap();

        let mut buf = BytesMut::new();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(20);
        assert!(client.read(&mut buf, Some(deadline)).await.is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register,
        Deregister,
        Close,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Register), Just(Op::Deregister), Just(Op::Close)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_unlinks_exactly_when_inactive_and_idle(
            ops in proptest::collection::vec(op(), 1..40),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let core = core(Arc::new(TestImplementation));
                let (conn, socket, _client) = connection(&core);

                let mut tasks = 0usize;
                let mut closed = false;
                for op in ops {
                    match op {
                        Op::Register if !conn.is_unlinked() => {
                            conn.register_task();
                            tasks += 1;
                        }
                        Op::Register => {}
                        Op::Deregister => {
                            conn.deregister_task().await;
                            tasks = tasks.saturating_sub(1);
                        }
                        Op::Close => {
                            conn.close().await;
                            closed = true;
                        }
                    }
                    prop_assert_eq!(conn.pending_tasks(), tasks);
                    prop_assert_eq!(conn.is_unlinked(), closed && tasks == 0);
                    prop_assert!(socket.close_count() <= 1);
                }
                Ok(())
            })?;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_close_and_deregister_unlink_once() {
        for _ in 0..50 {
            let core = core(Arc::new(TestImplementation));
            let (conn, socket, _client) = connection(&core);
            for _ in 0..8 {
                conn.register_task();
            }
            let mut handles = Vec::new();
            for _ in 0..8 {
                let conn = conn.clone();
                handles.push(tokio::spawn(async move { conn.deregister_task().await }));
            }
            let closer = {
                let conn = conn.clone();
                tokio::spawn(async move { conn.close().await })
            };
            for handle in handles {
                handle.await.unwrap();
            }
            closer.await.unwrap();

            assert!(conn.is_unlinked());
            assert_eq!(conn.pending_tasks(), 0);
            assert_eq!(socket.close_count(), 1);
        }
    }
}
