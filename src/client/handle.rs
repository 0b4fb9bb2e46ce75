//! Client read loop and inbound message routing.
//!
//! | Message                    | Route                                    | Released by |
//! |----------------------------|------------------------------------------|-------------|
//! | Reply (data)               | `RequestManager::fulfill`                | the caller  |
//! | ReplyError / special reply | `RequestManager::fail` with a typed error | here        |
//! | Signal                     | `ClientImplementation::on_signal`        | here, after the hook |
//! | NotifySessionCreated       | store session, `on_session_created`      | here        |
//! | NotifySessionClosed        | drop session, `on_session_closed`        | here        |
//! | anything else              | protocol violation, connection closed    | here        |

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::ClientInner;
use crate::error::{Result, WireError};
use crate::protocol::{Message, MessageType};
use crate::session::Session;
use crate::transport::ReadError;

/// Run a user hook, logging a panic instead of unwinding into the read loop.
pub(super) fn guarded(hook: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("{} hook panicked", hook);
    }
}

/// Read frames for connection `generation` until it fails or `stop` fires.
pub(super) async fn read_loop(inner: Arc<ClientInner>, generation: u64, stop: CancellationToken) {
    let reason = loop {
        let mut buf = inner.buffer_pool.acquire();
        let read = tokio::select! {
            read = inner.socket.read(&mut buf, None) => read,
            () = stop.cancelled() => Err(ReadError::Closed),
        };
        if let Err(e) = read {
            buf.release();
            break match e {
                ReadError::Closed => "connection closed".to_string(),
                ReadError::Timeout => "read deadline exceeded".to_string(),
                ReadError::Failed(e) => e.to_string(),
            };
        }

        let msg = match Message::parse_within(buf, inner.buffer_pool.capacity()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("closing connection: {}", e);
                break e.to_string();
            }
        };
        if let Err(e) = route(&inner, msg) {
            warn!("closing connection: {}", e);
            break e.to_string();
        }
    };

    if inner.teardown(generation, &reason).await && inner.autoconnect_enabled() {
        debug!("connection lost ({}), reconnecting", reason);
        inner.start_reconnect();
    }
}

/// Dispatch one inbound message.
fn route(inner: &ClientInner, msg: Message) -> Result<()> {
    let msg_type = msg.message_type();
    match msg_type {
        t if t.is_data_reply() => {
            if let Some(unmatched) = inner.requests.fulfill(msg) {
                debug!(
                    "discarding reply for unknown request {:?}",
                    unmatched.identifier()
                );
                unmatched.release();
            }
        }
        MessageType::ReplyError => {
            let err = WireError::Request {
                code: msg.name_lossy(),
                message: String::from_utf8_lossy(msg.payload()).into_owned(),
            };
            fail_request(inner, msg, err);
        }
        MessageType::ReplyInternalError => fail_request(inner, msg, WireError::Internal),
        MessageType::ReplyShutdown => fail_request(inner, msg, WireError::ServerShutdown),
        MessageType::ReplySessionNotFound => fail_request(inner, msg, WireError::SessionNotFound),
        MessageType::ReplySessionsDisabled => {
            fail_request(inner, msg, WireError::SessionsDisabled)
        }
        MessageType::ReplyMaxSessionConnectionsReached => {
            fail_request(inner, msg, WireError::MaxSessionConnectionsReached)
        }
        t if t.is_signal() => {
            guarded("on_signal", || inner.implementation.on_signal(&msg));
            msg.release();
        }
        MessageType::NotifySessionCreated => {
            let session = Session::from_json(msg.payload());
            msg.release();
            match session {
                Ok(session) => {
                    *inner.session.write() = Some(session.clone());
                    guarded("on_session_created", || {
                        inner.implementation.on_session_created(&session)
                    });
                }
                Err(e) => warn!("ignoring undecodable session notification: {}", e),
            }
        }
        MessageType::NotifySessionClosed => {
            msg.release();
            inner.clear_session();
        }
        MessageType::Heartbeat => msg.release(),
        other => {
            msg.release();
            return Err(WireError::ProtocolViolation(format!(
                "unexpected {:?} message from server",
                other
            )));
        }
    }
    Ok(())
}

fn fail_request(inner: &ClientInner, msg: Message, err: WireError) {
    let id = msg.identifier();
    msg.release();
    match id {
        Some(id) if inner.requests.fail(id, err) => {}
        _ => debug!("discarding {:?} for unknown request", id),
    }
}
