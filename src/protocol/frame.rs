//! Frame builders for every outbound message kind.
//!
//! Builders produce one contiguous `Bytes` per frame; the transport is
//! message-framed, so no length prefix is written.
//!
//! # Example
//!
//! ```
//! use wirelink::protocol::{build_request, Identifier, MessageType, Payload};
//!
//! let frame = build_request(Identifier::from_u64(1), Some(b"auth"), &Payload::utf8("x")).unwrap();
//! assert_eq!(frame[0], MessageType::RequestUtf8.as_byte());
//! assert_eq!(frame.len(), 1 + 8 + 1 + 4 + 1);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::message::Payload;
use super::wire_format::{
    Identifier, MessageType, ServerConfiguration, IDENTIFIER_SIZE, MAX_NAME_LENGTH,
};
use crate::error::{Result, WireError};

fn check_name(name: &[u8]) -> Result<()> {
    if name.len() > MAX_NAME_LENGTH {
        return Err(WireError::ProtocolViolation(format!(
            "name too long ({} bytes, max {})",
            name.len(),
            MAX_NAME_LENGTH
        )));
    }
    Ok(())
}

fn frame(
    msg_type: MessageType,
    identifier: Option<Identifier>,
    name: Option<&[u8]>,
    payload: &[u8],
) -> Bytes {
    let name_len = name.map_or(0, <[u8]>::len);
    let mut buf = BytesMut::with_capacity(
        1 + IDENTIFIER_SIZE + 1 + name_len + payload.len(),
    );
    buf.put_u8(msg_type.as_byte());
    if let Some(id) = identifier {
        buf.put_slice(id.as_bytes());
    }
    if msg_type.has_name() {
        // Length checked by the caller.
        buf.put_u8(name_len as u8);
        if let Some(name) = name {
            buf.put_slice(name);
        }
    }
    buf.put_slice(payload);
    buf.freeze()
}

/// Build a named request.
///
/// A request must carry a name, a payload, or both.
pub fn build_request(id: Identifier, name: Option<&[u8]>, payload: &Payload) -> Result<Bytes> {
    let name = name.filter(|n| !n.is_empty());
    if name.is_none() && payload.is_empty() {
        return Err(WireError::ProtocolViolation(
            "request requires either a name or a payload".to_string(),
        ));
    }
    if let Some(name) = name {
        check_name(name)?;
    }
    Ok(frame(
        MessageType::request(payload.encoding),
        Some(id),
        name,
        &payload.data,
    ))
}

/// Build a successful data reply.
pub fn build_reply(id: Identifier, payload: &Payload) -> Bytes {
    frame(MessageType::reply(payload.encoding), Some(id), None, &payload.data)
}

/// Build an application error reply. The code travels in the name field.
pub fn build_error_reply(id: Identifier, code: &str, message: &str) -> Result<Bytes> {
    if code.is_empty() {
        return Err(WireError::ProtocolViolation(
            "error reply requires a code".to_string(),
        ));
    }
    check_name(code.as_bytes())?;
    Ok(frame(
        MessageType::ReplyError,
        Some(id),
        Some(code.as_bytes()),
        message.as_bytes(),
    ))
}

/// Build a payload-less reply such as `ReplyShutdown` or `ReplySessionNotFound`.
pub fn build_special_reply(msg_type: MessageType, id: Identifier) -> Result<Bytes> {
    if !msg_type.is_reply() || msg_type.is_data_reply() || msg_type == MessageType::ReplyError {
        return Err(WireError::ProtocolViolation(format!(
            "{:?} is not a special reply",
            msg_type
        )));
    }
    Ok(frame(msg_type, Some(id), None, &[]))
}

/// Build a signal. Signals carry no identifier and an optional name.
pub fn build_signal(name: Option<&[u8]>, payload: &Payload) -> Result<Bytes> {
    if let Some(name) = name {
        check_name(name)?;
    }
    Ok(frame(
        MessageType::signal(payload.encoding),
        None,
        name,
        &payload.data,
    ))
}

/// Build a session-created notification carrying the JSON-encoded session.
pub fn build_session_created(session_json: &[u8]) -> Bytes {
    frame(MessageType::NotifySessionCreated, None, None, session_json)
}

/// Build a session-closed notification.
pub fn build_session_closed() -> Bytes {
    frame(MessageType::NotifySessionClosed, None, None, &[])
}

/// Build the accept-configuration handshake frame.
pub fn build_accept_configuration(conf: &ServerConfiguration) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::AcceptConfiguration.as_byte());
    conf.encode_into(&mut buf);
    buf.freeze()
}

/// Build a heartbeat probe.
pub fn build_heartbeat() -> Bytes {
    const HEARTBEAT: [u8; 1] = [MessageType::Heartbeat as u8];
    Bytes::from_static(&HEARTBEAT)
}

/// Build a restore-session request. The payload is the session key.
pub fn build_restore_session(id: Identifier, key: &[u8]) -> Bytes {
    frame(MessageType::RequestRestoreSession, Some(id), None, key)
}

/// Build a close-session request.
pub fn build_close_session(id: Identifier) -> Bytes {
    frame(MessageType::RequestCloseSession, Some(id), None, &[])
}
