//! Dialing and accept-configuration verification.

use tokio::time::Instant;
use tracing::debug;

use super::options::ClientOptions;
use crate::error::{Result, WireError};
use crate::protocol::{
    BufferPool, Message, MessageType, ServerConfiguration, PROTOCOL_MAJOR_VERSION,
    PROTOCOL_MINOR_VERSION,
};
use crate::transport::{ClientSocket, ReadError};

/// Dial `socket` and complete the handshake before `dialing_timeout`.
///
/// The socket is closed on any failure after a successful dial. A deadline
/// expiry is reported as `Disconnected` so the supervisor retries it;
/// configuration disagreements are reported as their own, non-retryable,
/// variants.
pub(crate) async fn dial(
    socket: &dyn ClientSocket,
    options: &ClientOptions,
    pool: &BufferPool,
) -> Result<ServerConfiguration> {
    let deadline = Instant::now() + options.dialing_timeout;
    socket.dial(deadline).await?;

    match await_configuration(socket, pool, deadline).await {
        Ok(conf) => match verify(&conf, options) {
            Ok(()) => {
                debug!(
                    "handshake complete (protocol {}.{}, read timeout {} ms)",
                    conf.major_protocol_version, conf.minor_protocol_version, conf.read_timeout_ms
                );
                Ok(conf)
            }
            Err(e) => {
                socket.close().await;
                Err(e)
            }
        },
        Err(e) => {
            socket.close().await;
            Err(e)
        }
    }
}

async fn await_configuration(
    socket: &dyn ClientSocket,
    pool: &BufferPool,
    deadline: Instant,
) -> Result<ServerConfiguration> {
    let mut buf = pool.acquire();
    if let Err(e) = socket.read(&mut buf, Some(deadline)).await {
        buf.release();
        return Err(match e {
            ReadError::Closed => {
                WireError::Disconnected("closed before accept-configuration".to_string())
            }
            ReadError::Timeout => {
                WireError::Disconnected("timed out awaiting accept-configuration".to_string())
            }
            ReadError::Failed(e) => e,
        });
    }

    let msg = Message::parse_within(buf, pool.capacity())?;
    if msg.message_type() != MessageType::AcceptConfiguration {
        let got = msg.message_type();
        msg.release();
        return Err(WireError::ProtocolViolation(format!(
            "expected accept-configuration, got {:?}",
            got
        )));
    }
    let conf = msg.server_configuration();
    msg.release();
    conf
}

/// Check the server's configuration against ours.
pub(crate) fn verify(conf: &ServerConfiguration, options: &ClientOptions) -> Result<()> {
    if conf.major_protocol_version != PROTOCOL_MAJOR_VERSION {
        return Err(WireError::IncompatibleProtocolVersion {
            server: format!(
                "{}.{}",
                conf.major_protocol_version, conf.minor_protocol_version
            ),
            supported: format!("{}.{}", PROTOCOL_MAJOR_VERSION, PROTOCOL_MINOR_VERSION),
        });
    }

    let server_name = conf.sub_protocol_name.as_deref();
    let client_name = options.sub_protocol_name.as_deref().map(str::as_bytes);
    if server_name != client_name {
        return Err(WireError::SubProtocolMismatch {
            client: options.sub_protocol_name.clone(),
            server: server_name.map(|n| String::from_utf8_lossy(n).into_owned()),
        });
    }

    if conf.message_buffer_size != options.message_buffer_size {
        return Err(WireError::BufferSizeMismatch {
            client: options.message_buffer_size,
            server: conf.message_buffer_size,
        });
    }
    Ok(())
}
