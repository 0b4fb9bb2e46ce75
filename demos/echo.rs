//! Echo server and client in one process.
//!
//! This example demonstrates:
//! - Implementing `ServerImplementation` with a single request handler
//! - Serving a `MemoryNetwork` listener
//! - Sending requests in different payload encodings
//!
//! ```text
//! RUST_LOG=debug cargo run --example echo
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing_subscriber::EnvFilter;

use wirelink::client::{Client, NoopClient};
use wirelink::protocol::{Message, Payload};
use wirelink::server::{Connection, RequestContext, Server, ServerImplementation};
use wirelink::transport::MemoryNetwork;
use wirelink::Result;

struct Echo;

#[async_trait]
impl ServerImplementation for Echo {
    async fn on_request(
        &self,
        _ctx: RequestContext,
        conn: &Arc<Connection>,
        msg: &Message,
    ) -> Result<Payload> {
        tracing::info!("{} asked {:?}", conn.id(), msg.name_lossy());
        Ok(msg.payload_owned())
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let network = MemoryNetwork::new();
    let server = Server::builder(Arc::new(Echo)).build()?;
    let accept = tokio::spawn({
        let server = server.clone();
        let listener = network.listen();
        async move { server.run(listener).await }
    });

    let client = Client::builder(Arc::new(NoopClient), Arc::new(network.client_socket())).build()?;
    client.connect().await?;

    let reply = client.request("echo", Payload::utf8("hello")).await?;
    println!("utf8  -> {}", reply.payload_str()?);

    let reply = client.request("echo", Payload::utf16("grüße")).await?;
    println!("utf16 -> {}", reply.payload_string()?);

    let reply = client.request("echo", Payload::binary(vec![0xde, 0xad, 0xbe, 0xef])).await?;
    println!("bytes -> {:02x?}", reply.payload());

    client.close().await;
    server.shutdown().await;
    accept.await??;
    Ok(())
}
