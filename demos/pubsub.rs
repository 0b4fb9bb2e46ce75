//! Chat-style pub-sub over sessions and signals.
//!
//! This example demonstrates:
//! - Creating a session from a login request
//! - Broadcasting signals to every connected client
//! - Receiving signals and session notifications on the client
//!
//! ```text
//! RUST_LOG=info cargo run --example pubsub
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

use wirelink::client::{Client, ClientImplementation};
use wirelink::protocol::{Message, Payload};
use wirelink::server::{Connection, RequestContext, Server, ServerImplementation};
use wirelink::session::{JsonSessionInfo, Session};
use wirelink::transport::MemoryNetwork;
use wirelink::{Result, WireError};

/// Accepts any "user:password" pair whose password is "secret" and
/// broadcasts "msg" requests to everyone.
#[derive(Default)]
struct Chat {
    server: std::sync::OnceLock<Server>,
}

#[async_trait]
impl ServerImplementation for Chat {
    async fn on_request(
        &self,
        _ctx: RequestContext,
        conn: &Arc<Connection>,
        msg: &Message,
    ) -> Result<Payload> {
        match msg.name() {
            Some(b"login") => {
                let credentials = msg.payload_str()?;
                let (user, password) = credentials
                    .split_once(':')
                    .ok_or_else(|| WireError::request("BAD_REQUEST", "expected user:password"))?;
                if password != "secret" {
                    return Err(WireError::request("INVALID_CREDENTIALS", "wrong password"));
                }
                let mut info = Map::new();
                info.insert("user".to_string(), Value::from(user));
                conn.create_session(Some(Arc::new(JsonSessionInfo(info))))
                    .await?;
                Ok(Payload::empty())
            }
            Some(b"msg") => {
                let user = match conn.session_info("user") {
                    Some(Value::String(user)) => user,
                    _ => return Err(WireError::request("UNAUTHORIZED", "log in first")),
                };
                let text = format!("{}: {}", user, msg.payload_str()?);
                if let Some(server) = self.server.get() {
                    for peer in server.connections() {
                        // Failures are logged by the connection.
                        let _ = peer.signal(Some(&b"chat"[..]), Payload::utf8(text.clone())).await;
                    }
                }
                Ok(Payload::empty())
            }
            _ => Err(WireError::request("UNKNOWN_METHOD", msg.name_lossy())),
        }
    }
}

struct Member {
    name: &'static str,
}

impl ClientImplementation for Member {
    fn on_session_created(&self, session: &Session) {
        println!("[{}] logged in with session {}", self.name, session.key);
    }

    fn on_session_closed(&self) {
        println!("[{}] logged out", self.name);
    }

    fn on_signal(&self, msg: &Message) {
        if let Ok(text) = msg.payload_str() {
            println!("[{}] {}", self.name, text);
        }
    }
}

async fn join(network: &MemoryNetwork, name: &'static str) -> Result<Client> {
    let client = Client::builder(Arc::new(Member { name }), Arc::new(network.client_socket()))
        .default_request_timeout(Duration::from_secs(2))
        .build()?;
    client
        .request("login", Payload::utf8(format!("{}:secret", name)))
        .await?
        .release();
    Ok(client)
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let chat = Arc::new(Chat::default());
    let network = MemoryNetwork::new();
    let server = Server::builder(chat.clone()).build()?;
    let _ = chat.server.set(server.clone());
    tokio::spawn({
        let server = server.clone();
        let listener = network.listen();
        async move { server.run(listener).await }
    });

    let alice = join(&network, "alice").await?;
    let bob = join(&network, "bob").await?;

    alice.request("msg", Payload::utf8("hi bob")).await?.release();
    bob.request("msg", Payload::utf8("hi alice")).await?.release();

    if let Err(e) = alice.request("nope", Payload::empty()).await {
        println!("[alice] {}", e);
    }

    // Give the signals a moment to arrive before logging out.
    tokio::time::sleep(Duration::from_millis(50)).await;
    alice.close_session().await?;
    bob.close_session().await?;

    server.shutdown().await;
    Ok(())
}
