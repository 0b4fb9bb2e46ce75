//! Integration tests for wirelink.
//!
//! A real server and real clients talk over the in-memory transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use wirelink::client::{Autoconnect, Client, ClientImplementation, RequestScope, Status};
use wirelink::protocol::{Encoding, Message, Payload};
use wirelink::server::{
    ClientInfo, Connection, ConnectionOptions, RequestContext, Server, ServerImplementation,
    ServerOptions,
};
use wirelink::session::{JsonSessionInfo, Session};
use wirelink::transport::MemoryNetwork;
use wirelink::{Result, WireError};

const SLOW: Duration = Duration::from_millis(250);

#[derive(Default)]
struct App {
    concurrency_limit: Option<usize>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    signals: Mutex<Vec<String>>,
}

#[async_trait]
impl ServerImplementation for App {
    async fn on_request(
        &self,
        _ctx: RequestContext,
        conn: &Arc<Connection>,
        msg: &Message,
    ) -> Result<Payload> {
        match msg.name() {
            Some(b"auth") => {
                if msg.payload_str()? != "alice:secret" {
                    return Err(WireError::request(
                        "INVALID_CREDENTIALS",
                        "wrong user or password",
                    ));
                }
                let mut info = Map::new();
                info.insert("user".to_string(), Value::from("alice"));
                conn.create_session(Some(Arc::new(JsonSessionInfo(info))))
                    .await?;
                let key = conn.session_key().ok_or(WireError::Internal)?;
                Ok(Payload::binary(key.into_bytes()))
            }
            Some(b"whoami") => match conn.session_info("user") {
                Some(Value::String(user)) => Ok(Payload::utf8(user)),
                _ => Err(WireError::request("NO_SESSION", "not logged in")),
            },
            Some(b"slow") => {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(SLOW).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(msg.payload_owned())
            }
            Some(b"fail") => Err(WireError::request("FAILED", "as requested")),
            Some(b"panic") => panic!("handler bug"),
            _ => Ok(msg.payload_owned()),
        }
    }

    async fn on_signal(&self, _ctx: RequestContext, _conn: &Arc<Connection>, msg: &Message) {
        if let Ok(text) = msg.payload_string() {
            self.signals.lock().push(text);
        }
    }

    fn before_accept(&self, info: &ClientInfo) -> ConnectionOptions {
        if info.user_agent.as_deref() == Some("blocked") {
            return ConnectionOptions::refuse();
        }
        ConnectionOptions {
            concurrency_limit: self.concurrency_limit,
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl ClientImplementation for Recorder {
    fn on_session_created(&self, session: &Session) {
        self.events
            .lock()
            .push(format!("session_created:{}", session.key));
    }

    fn on_session_closed(&self) {
        self.events.lock().push("session_closed".to_string());
    }

    fn on_signal(&self, msg: &Message) {
        let text = msg.payload_string().unwrap_or_default();
        self.events.lock().push(format!("signal:{}", text));
    }
}

struct Harness {
    network: MemoryNetwork,
    server: Server,
    app: Arc<App>,
}

impl Harness {
    fn start(app: App, options: ServerOptions) -> Self {
        let app = Arc::new(app);
        let network = MemoryNetwork::new();
        let server = Server::builder(app.clone())
            .options(options)
            .build()
            .unwrap();
        let listener = network.listen();
        tokio::spawn({
            let server = server.clone();
            async move { server.run(listener).await }
        });
        Self {
            network,
            server,
            app,
        }
    }

    fn new() -> Self {
        Self::start(App::default(), ServerOptions::default())
    }

    fn client(&self, autoconnect: Autoconnect) -> (Client, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let client = Client::builder(recorder.clone(), Arc::new(self.network.client_socket()))
            .autoconnect(autoconnect)
            .dialing_timeout(Duration::from_millis(500))
            .reconnection_interval(Duration::from_millis(20))
            .default_request_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        (client, recorder)
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[tokio::test]
async fn test_echo_request() {
    let harness = Harness::new();
    let (client, _) = harness.client(Autoconnect::Enabled);
    client.connect().await.unwrap();
    assert_eq!(client.status(), Status::Connected);

    let reply = client.request("echo", Payload::utf8("hi")).await.unwrap();
    assert_eq!(reply.encoding(), Encoding::Utf8);
    assert_eq!(reply.payload_str().unwrap(), "hi");

    let reply = client
        .request("echo", Payload::utf16("grüße"))
        .await
        .unwrap();
    assert_eq!(reply.encoding(), Encoding::Utf16);
    assert_eq!(reply.payload_string().unwrap(), "grüße");
}

#[tokio::test]
async fn test_autoconnect_on_first_request() {
    let harness = Harness::new();
    let (client, _) = harness.client(Autoconnect::Enabled);
    assert_eq!(client.status(), Status::Disconnected);

    let reply = client.request("echo", Payload::binary(vec![1u8, 2, 3])).await.unwrap();
    assert_eq!(reply.payload(), &[1, 2, 3]);
    assert_eq!(client.status(), Status::Connected);
}

#[tokio::test]
async fn test_auth_creates_session() {
    let harness = Harness::new();
    let (client, recorder) = harness.client(Autoconnect::Enabled);

    let reply = client
        .request("auth", Payload::utf8("alice:secret"))
        .await
        .unwrap();
    assert_eq!(reply.encoding(), Encoding::Binary);
    let key = String::from_utf8(reply.payload().to_vec()).unwrap();
    assert_eq!(key.len(), 64);

    // The notification is read before the reply.
    assert_eq!(client.session_key().as_deref(), Some(key.as_str()));
    assert_eq!(client.session_info("user"), Some(Value::from("alice")));
    assert_eq!(recorder.events(), vec![format!("session_created:{}", key)]);
    assert_eq!(harness.server.session_connections(&key).len(), 1);

    let who = client.request("whoami", Payload::empty()).await.unwrap();
    assert_eq!(who.payload_str().unwrap(), "alice");
}

#[tokio::test]
async fn test_wrong_credentials_error_reply() {
    let harness = Harness::new();
    let (client, _) = harness.client(Autoconnect::Enabled);

    let err = client
        .request("auth", Payload::utf8("alice:wrong"))
        .await
        .unwrap_err();
    match err {
        WireError::Request { code, message } => {
            assert_eq!(code, "INVALID_CREDENTIALS");
            assert_eq!(message, "wrong user or password");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(client.session().is_none());
}

#[tokio::test]
async fn test_handler_panic_is_internal_error() {
    let harness = Harness::new();
    let (client, _) = harness.client(Autoconnect::Enabled);

    let err = client.request("panic", Payload::empty()).await.unwrap_err();
    assert!(matches!(err, WireError::Internal));

    // The connection and the read loop survive.
    let reply = client.request("echo", Payload::utf8("still here")).await.unwrap();
    assert_eq!(reply.payload_str().unwrap(), "still here");
}

#[tokio::test]
async fn test_server_signal_reaches_client() {
    let harness = Harness::new();
    let (client, recorder) = harness.client(Autoconnect::Enabled);
    client.connect().await.unwrap();
    assert!(eventually(|| harness.server.connection_count() == 1).await);

    let conn = harness.server.connections().remove(0);
    conn.signal(None, Payload::utf8("hello")).await.unwrap();

    assert!(eventually(|| recorder.events() == vec!["signal:hello".to_string()]).await);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_client_signal_reaches_server() {
    let harness = Harness::new();
    let (client, _) = harness.client(Autoconnect::Enabled);

    client
        .signal("note", Payload::utf8("from client"))
        .await
        .unwrap();
    assert!(eventually(|| harness.app.signals.lock().len() == 1).await);
    assert_eq!(harness.app.signals.lock()[0], "from client");
}

#[tokio::test]
async fn test_request_timeout_discards_late_reply() {
    let harness = Harness::new();
    let (client, _) = harness.client(Autoconnect::Enabled);
    client.connect().await.unwrap();

    let started = std::time::Instant::now();
    let result = client
        .request_with(
            "slow",
            Payload::utf8("late"),
            RequestScope::with_timeout(Duration::from_millis(50)),
        )
        .await;
    assert!(matches!(result, Err(WireError::Timeout)));
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(client.pending_requests(), 0);

    // Let the late reply arrive; it must not disturb the next request.
    tokio::time::sleep(SLOW).await;
    let reply = client.request("echo", Payload::utf8("next")).await.unwrap();
    assert_eq!(reply.payload_str().unwrap(), "next");
}

#[tokio::test]
async fn test_cancel_request() {
    let harness = Harness::new();
    let (client, _) = harness.client(Autoconnect::Enabled);
    client.connect().await.unwrap();

    let token = tokio_util::sync::CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });
    let result = client
        .request_with("slow", Payload::utf8("x"), RequestScope::with_cancel(token))
        .await;
    assert!(matches!(result, Err(WireError::Canceled)));
}

#[tokio::test]
async fn test_concurrency_limit_bounds_handlers() {
    let harness = Harness::start(
        App {
            concurrency_limit: Some(1),
            ..Default::default()
        },
        ServerOptions::default(),
    );
    let (client, _) = harness.client(Autoconnect::Enabled);
    client.connect().await.unwrap();

    let mut requests = Vec::new();
    for i in 0..4 {
        let client = client.clone();
        requests.push(tokio::spawn(async move {
            client.request("slow", Payload::utf8(format!("{}", i))).await
        }));
    }
    for request in requests {
        assert!(request.await.unwrap().is_ok());
    }
    assert_eq!(harness.app.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_pending_requests_fail_on_close() {
    let harness = Harness::new();
    let (client, _) = harness.client(Autoconnect::Enabled);
    client.connect().await.unwrap();

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.request("slow", Payload::utf8("x")).await }
    });
    assert!(eventually(|| client.pending_requests() == 1).await);

    client.close().await;
    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_disconnected());
    assert_eq!(client.status(), Status::Disconnected);
}

/// Request header: type byte, identifier, name length and "echo".
const ECHO_OVERHEAD: usize = 1 + 8 + 1 + 4;

fn small_buffer_pair() -> (Harness, Client) {
    let harness = Harness::start(
        App::default(),
        ServerOptions {
            message_buffer_size: 1024,
            ..ServerOptions::default()
        },
    );
    let client = Client::builder(
        Arc::new(Recorder::default()),
        Arc::new(harness.network.client_socket()),
    )
    .autoconnect(Autoconnect::Disabled)
    .message_buffer_size(1024)
    .default_request_timeout(Duration::from_secs(5))
    .build()
    .unwrap();
    (harness, client)
}

#[tokio::test]
async fn test_frame_at_buffer_size_is_served() {
    let (_harness, client) = small_buffer_pair();
    client.connect().await.unwrap();

    let payload = vec![7u8; 1024 - ECHO_OVERHEAD];
    let reply = client
        .request("echo", Payload::binary(payload.clone()))
        .await
        .unwrap();
    assert_eq!(reply.payload(), &payload[..]);
    assert_eq!(client.status(), Status::Connected);
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let (harness, client) = small_buffer_pair();
    client.connect().await.unwrap();

    let payload = vec![7u8; 1024 - ECHO_OVERHEAD + 1];
    let err = client
        .request("echo", Payload::binary(payload))
        .await
        .unwrap_err();
    assert!(err.is_disconnected());
    assert!(eventually(|| harness.server.connection_count() == 0).await);
    assert_eq!(client.status(), Status::Disconnected);
}

#[tokio::test]
async fn test_reconnect_restores_session() {
    let harness = Harness::new();
    let (client, _) = harness.client(Autoconnect::Enabled);
    let reply = client
        .request("auth", Payload::utf8("alice:secret"))
        .await
        .unwrap();
    let key = String::from_utf8(reply.payload().to_vec()).unwrap();

    // Drop the connection from the server side.
    let conn = harness.server.connections().remove(0);
    conn.close().await;

    assert!(eventually(|| harness.server.session_connections(&key).len() == 1).await);
    assert_eq!(client.status(), Status::Connected);
    assert_eq!(client.session_key().as_deref(), Some(key.as_str()));

    let who = client.request("whoami", Payload::empty()).await.unwrap();
    assert_eq!(who.payload_str().unwrap(), "alice");
}

#[tokio::test]
async fn test_disabled_autoconnect_stays_down() {
    let harness = Harness::new();
    let (client, _) = harness.client(Autoconnect::Disabled);
    client.connect().await.unwrap();

    let conn = harness.server.connections().remove(0);
    conn.close().await;
    assert!(eventually(|| client.status() == Status::Disconnected).await);

    let err = client.request("echo", Payload::utf8("x")).await.unwrap_err();
    assert!(err.is_disconnected());
}

#[tokio::test]
async fn test_shared_session_and_close() {
    let harness = Harness::new();
    let (first, first_events) = harness.client(Autoconnect::Enabled);
    let (second, second_events) = harness.client(Autoconnect::Enabled);

    let reply = first
        .request("auth", Payload::utf8("alice:secret"))
        .await
        .unwrap();
    let key = String::from_utf8(reply.payload().to_vec()).unwrap();

    second.restore_session(&key).await.unwrap();
    assert_eq!(second.session_key().as_deref(), Some(key.as_str()));
    assert_eq!(harness.server.session_connections(&key).len(), 2);

    // A second restore on the same client conflicts locally.
    assert!(matches!(
        second.restore_session(&key).await,
        Err(WireError::SessionConflict(_))
    ));

    second.close_session().await.unwrap();
    assert!(second.session().is_none());
    assert_eq!(second_events.events(), vec!["session_closed".to_string()]);
    assert_eq!(harness.server.session_connections(&key).len(), 1);
    assert_eq!(first.session_key().as_deref(), Some(key.as_str()));

    first.close_session().await.unwrap();
    assert_eq!(harness.server.active_session_count(), 0);
    assert_eq!(first_events.events().last().map(String::as_str), Some("session_closed"));

    // The last member destroyed it.
    let (third, _) = harness.client(Autoconnect::Enabled);
    assert!(matches!(
        third.restore_session(&key).await,
        Err(WireError::SessionNotFound)
    ));
}

#[tokio::test]
async fn test_max_session_connections() {
    let harness = Harness::start(
        App::default(),
        ServerOptions {
            max_session_connections: 1,
            ..Default::default()
        },
    );
    let (first, _) = harness.client(Autoconnect::Enabled);
    let (second, _) = harness.client(Autoconnect::Enabled);

    let reply = first
        .request("auth", Payload::utf8("alice:secret"))
        .await
        .unwrap();
    let key = String::from_utf8(reply.payload().to_vec()).unwrap();

    assert!(matches!(
        second.restore_session(&key).await,
        Err(WireError::MaxSessionConnectionsReached)
    ));
}

#[tokio::test]
async fn test_sessions_disabled() {
    let harness = Harness::start(
        App::default(),
        ServerOptions {
            sessions_enabled: false,
            ..Default::default()
        },
    );
    let (client, _) = harness.client(Autoconnect::Enabled);

    // create_session fails inside the handler, which reports an internal error.
    let err = client
        .request("auth", Payload::utf8("alice:secret"))
        .await
        .unwrap_err();
    assert!(matches!(err, WireError::Internal));

    assert!(matches!(
        client.restore_session("anything").await,
        Err(WireError::SessionsDisabled)
    ));
}

#[tokio::test]
async fn test_refused_client() {
    let harness = Harness::new();
    let socket = harness.network.client_socket().with_user_agent("blocked");
    let client = Client::builder(Arc::new(Recorder::default()), Arc::new(socket))
        .autoconnect(Autoconnect::Disabled)
        .dialing_timeout(Duration::from_millis(200))
        .build()
        .unwrap();

    let err = client.connect().await.unwrap_err();
    assert!(err.is_disconnected());
    assert_eq!(harness.server.connection_count(), 0);
}

#[tokio::test]
async fn test_shutdown_replies_and_drains() {
    let harness = Harness::new();
    let (client, _) = harness.client(Autoconnect::Disabled);
    client.connect().await.unwrap();

    let in_flight = tokio::spawn({
        let client = client.clone();
        async move { client.request("slow", Payload::utf8("finish me")).await }
    });
    assert!(eventually(|| harness.app.in_flight.load(Ordering::SeqCst) == 1).await);

    let shutdown = tokio::spawn({
        let server = harness.server.clone();
        async move { server.shutdown().await }
    });
    assert!(eventually(|| harness.server.is_shutting_down()).await);

    let err = client.request("echo", Payload::utf8("x")).await.unwrap_err();
    assert!(matches!(err, WireError::ServerShutdown));

    // The running handler still completes before the connection closes.
    let reply = in_flight.await.unwrap().unwrap();
    assert_eq!(reply.payload_str().unwrap(), "finish me");

    shutdown.await.unwrap();
    assert_eq!(harness.server.connection_count(), 0);
    assert!(eventually(|| client.status() == Status::Disconnected).await);
}
