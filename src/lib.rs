//! # wirelink
//!
//! Bidirectional request/reply and signal protocol over message-oriented
//! sockets (WebSocket, in-process channels, ...).
//!
//! ## Architecture
//!
//! - **Protocol**: binary frames with a type byte, an optional 8-byte
//!   correlation identifier, an optional name and a tagged payload
//! - **Server**: per-connection read loops, admission-controlled handlers,
//!   sessions shared across connections, graceful shutdown
//! - **Client**: dial + handshake, request correlation, heartbeat and
//!   single-flight background reconnection
//!
//! ## Example
//!
//! ```ignore
//! use wirelink::prelude::*;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl ServerImplementation for Echo {
//!     async fn on_request(&self, _: RequestContext, _: &Arc<Connection>, msg: &Message)
//!         -> Result<Payload>
//!     {
//!         Ok(msg.payload_owned())
//!     }
//! }
//!
//! let network = MemoryNetwork::new();
//! let server = Server::builder(Arc::new(Echo)).build()?;
//! tokio::spawn({
//!     let server = server.clone();
//!     let listener = network.listen();
//!     async move { server.run(listener).await }
//! });
//!
//! let client = Client::builder(Arc::new(NoopClient), Arc::new(network.client_socket())).build()?;
//! let reply = client.request("echo", Payload::utf8("hi")).await?;
//! ```

pub mod admission;
pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

mod duration_ms;

pub use client::{Client, ClientBuilder, ClientImplementation, ClientOptions};
pub use error::{Result, WireError};
pub use protocol::{Message, Payload};
pub use server::{Server, ServerBuilder, ServerImplementation, ServerOptions};
pub use session::Session;

/// Commonly used items.
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::client::{
        Autoconnect, Client, ClientImplementation, NoopClient, RequestScope, Status,
    };
    pub use crate::error::{Result, WireError};
    pub use crate::protocol::{Encoding, Message, Payload};
    pub use crate::server::{
        Connection, ConnectionOptions, RequestContext, Server, ServerImplementation,
    };
    pub use crate::session::{JsonSessionInfo, Session};
    pub use crate::transport::{MemoryNetwork, Socket};
}
