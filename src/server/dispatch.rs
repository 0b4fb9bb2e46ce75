//! Per-connection read loop and handler dispatch.
//!
//! ```text
//! read frame ──► Message::parse ──┬─ Heartbeat ............ release
//!                                 ├─ Signal ─────┐
//!                                 ├─ Request ────┼─► admission slot ─► register_task
//!                                 │              │        └─► spawn handler (catch_unwind)
//!                                 │              │                └─► reply, release, deregister_task
//!                                 ├─ RestoreSession / CloseSession ... handled inline
//!                                 └─ anything else ................. protocol violation, close
//! ```
//!
//! Request and signal messages are released after the handler returns;
//! everything else is released by the loop before it continues.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::connection::{ClientInfo, Connection, ConnectionId};
use super::context::RequestContext;
use super::options::Acceptance;
use super::ServerCore;
use crate::error::WireError;
use crate::protocol::{
    build_accept_configuration, build_error_reply, build_reply, build_special_reply, Encoding,
    Identifier, Message, MessageType, Payload,
};
use crate::transport::{Accepted, ReadError};

/// Error code sent when a restore is attempted while a session is attached.
pub const SESSION_ACTIVE_CODE: &str = "SESSION_ACTIVE";

/// Serve one accepted socket until it closes.
pub(crate) async fn serve(core: Arc<ServerCore>, accepted: Accepted) {
    let Accepted { socket, user_agent } = accepted;

    if core.is_shutting_down() {
        socket.close().await;
        return;
    }

    let info = ClientInfo {
        connection_time: Utc::now(),
        remote_addr: socket.remote_addr(),
        user_agent,
    };
    let options = core.implementation.before_accept(&info);
    if options.acceptance == Acceptance::Refuse {
        debug!("refused client {:?}", info.remote_addr);
        socket.close().await;
        return;
    }

    let handshake = build_accept_configuration(&core.options.server_configuration());
    if let Err(e) = socket.write(handshake).await {
        warn!("failed sending accept-configuration: {}", e);
        socket.close().await;
        return;
    }

    let id = ConnectionId(core.next_connection_id());
    let conn = Arc::new(Connection::new(id, socket, core.clone(), info, options));
    core.connections.lock().insert(id, conn.clone());
    if core.is_shutting_down() {
        conn.close().await;
        return;
    }

    debug!("{} connected from {:?}", id, conn.remote_addr());
    core.implementation
        .on_client_connected(conn.options(), &conn)
        .await;

    let reason = read_loop(&core, &conn).await;

    core.implementation
        .on_client_disconnected(&conn, reason.as_ref())
        .await;
    conn.close().await;
}

/// Read and dispatch frames. Returns the error that ended the loop, if any.
async fn read_loop(core: &Arc<ServerCore>, conn: &Arc<Connection>) -> Option<WireError> {
    let read_timeout = core.options.read_timeout;
    loop {
        let mut buf = core.buffer_pool.acquire();
        let deadline = (!read_timeout.is_zero()).then(|| Instant::now() + read_timeout);

        if let Err(e) = conn.socket().read(&mut buf, deadline).await {
            buf.release();
            return match e {
                ReadError::Closed => None,
                ReadError::Timeout => {
                    debug!("{} missed its read deadline", conn.id());
                    Some(WireError::Timeout)
                }
                ReadError::Failed(e) => {
                    debug!("read failed on {}: {}", conn.id(), e);
                    Some(e)
                }
            };
        }

        let msg = match Message::parse_within(buf, core.buffer_pool.capacity()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("closing {}: {}", conn.id(), e);
                return Some(e);
            }
        };

        if let Err(e) = dispatch(core, conn, msg).await {
            warn!("closing {}: {}", conn.id(), e);
            return Some(e);
        }
    }
}

async fn dispatch(
    core: &Arc<ServerCore>,
    conn: &Arc<Connection>,
    msg: Message,
) -> Result<(), WireError> {
    let msg_type = msg.message_type();
    match msg_type {
        MessageType::Heartbeat => {
            msg.release();
            Ok(())
        }
        MessageType::RequestRestoreSession => {
            handle_restore_session(core, conn, msg).await;
            Ok(())
        }
        MessageType::RequestCloseSession => {
            handle_close_session(core, conn, msg).await;
            Ok(())
        }
        t if t.is_request() => {
            handle_request(core, conn, msg).await;
            Ok(())
        }
        t if t.is_signal() => {
            handle_signal(core, conn, msg).await;
            Ok(())
        }
        other => {
            msg.release();
            Err(WireError::ProtocolViolation(format!(
                "unexpected {:?} message from client",
                other
            )))
        }
    }
}

fn request_id(msg: &Message) -> Identifier {
    msg.identifier().unwrap_or(Identifier::ZERO)
}

fn special_reply(msg_type: MessageType, id: Identifier) -> Option<Bytes> {
    match build_special_reply(msg_type, id) {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!("failed building {:?}: {}", msg_type, e);
            None
        }
    }
}

async fn send_reply(conn: &Connection, frame: Option<Bytes>) {
    if let Some(frame) = frame {
        if let Err(e) = conn.write(frame).await {
            debug!("failed sending reply on {}: {}", conn.id(), e);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

async fn handle_request(core: &Arc<ServerCore>, conn: &Arc<Connection>, msg: Message) {
    let id = request_id(&msg);

    if core.is_shutting_down() {
        msg.release();
        send_reply(conn, special_reply(MessageType::ReplyShutdown, id)).await;
        return;
    }

    let slot = match conn.admission().acquire().await {
        Ok(slot) => slot,
        Err(_) => {
            msg.release();
            send_reply(conn, special_reply(MessageType::ReplyShutdown, id)).await;
            return;
        }
    };

    conn.register_task();
    let ctx = RequestContext::new(Some(id), conn.closed_token().child_token());
    let core = core.clone();
    let conn = conn.clone();
    core.handlers.clone().spawn(async move {
        let _slot = slot;
        let result = AssertUnwindSafe(core.implementation.on_request(ctx, &conn, &msg))
            .catch_unwind()
            .await;
        msg.release();

        let frame = match result {
            Ok(Ok(payload)) => Some(build_reply(id, &payload)),
            Ok(Err(WireError::Request { code, message })) => {
                match build_error_reply(id, &code, &message) {
                    Ok(frame) => Some(frame),
                    Err(e) => {
                        warn!("invalid error reply from handler: {}", e);
                        special_reply(MessageType::ReplyInternalError, id)
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("request handler failed on {}: {}", conn.id(), e);
                special_reply(MessageType::ReplyInternalError, id)
            }
            Err(panic) => {
                error!(
                    "request handler panicked on {}: {}",
                    conn.id(),
                    panic_message(panic.as_ref())
                );
                special_reply(MessageType::ReplyInternalError, id)
            }
        };
        send_reply(&conn, frame).await;
        conn.deregister_task().await;
    });
}

async fn handle_signal(core: &Arc<ServerCore>, conn: &Arc<Connection>, msg: Message) {
    if core.is_shutting_down() {
        msg.release();
        return;
    }

    let Ok(slot) = conn.admission().acquire().await else {
        msg.release();
        return;
    };

    conn.register_task();
    let ctx = RequestContext::new(None, conn.closed_token().child_token());
    let core = core.clone();
    let conn = conn.clone();
    core.handlers.clone().spawn(async move {
        let _slot = slot;
        let result = AssertUnwindSafe(core.implementation.on_signal(ctx, &conn, &msg))
            .catch_unwind()
            .await;
        msg.release();
        if let Err(panic) = result {
            error!(
                "signal handler panicked on {}: {}",
                conn.id(),
                panic_message(panic.as_ref())
            );
        }
        conn.deregister_task().await;
    });
}

async fn handle_restore_session(core: &Arc<ServerCore>, conn: &Arc<Connection>, msg: Message) {
    let id = request_id(&msg);
    let key = String::from_utf8_lossy(msg.payload()).into_owned();
    msg.release();

    if core.is_shutting_down() {
        send_reply(conn, special_reply(MessageType::ReplyShutdown, id)).await;
        return;
    }

    let frame = match conn.restore_session(&key).await {
        Ok(session) => match session.to_json() {
            Ok(json) => Some(build_reply(id, &Payload::new(Encoding::Utf8, json))),
            Err(e) => {
                warn!("failed encoding restored session: {}", e);
                special_reply(MessageType::ReplyInternalError, id)
            }
        },
        Err(WireError::SessionsDisabled) => special_reply(MessageType::ReplySessionsDisabled, id),
        Err(WireError::SessionNotFound) => special_reply(MessageType::ReplySessionNotFound, id),
        Err(WireError::MaxSessionConnectionsReached) => {
            special_reply(MessageType::ReplyMaxSessionConnectionsReached, id)
        }
        Err(WireError::SessionConflict(message)) => {
            build_error_reply(id, SESSION_ACTIVE_CODE, &message).ok()
        }
        Err(e) => {
            warn!("session restoration failed on {}: {}", conn.id(), e);
            special_reply(MessageType::ReplyInternalError, id)
        }
    };
    send_reply(conn, frame).await;
}

async fn handle_close_session(core: &Arc<ServerCore>, conn: &Arc<Connection>, msg: Message) {
    let id = request_id(&msg);
    msg.release();

    if core.is_shutting_down() {
        send_reply(conn, special_reply(MessageType::ReplyShutdown, id)).await;
        return;
    }

    let frame = match conn.close_session().await {
        Ok(()) => Some(build_reply(id, &Payload::empty())),
        Err(WireError::SessionsDisabled) => special_reply(MessageType::ReplySessionsDisabled, id),
        Err(e) => {
            warn!("closing session failed on {}: {}", conn.id(), e);
            special_reply(MessageType::ReplyInternalError, id)
        }
    };
    send_reply(conn, frame).await;
}
