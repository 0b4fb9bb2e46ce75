//! Decoded inbound messages.
//!
//! A [`Message`] owns the pooled buffer its frame was read into. Accessors
//! borrow from that buffer, so the borrow checker rules out reading a payload
//! after [`Message::release`] has handed the buffer back to the pool.
//!
//! # Example
//!
//! ```
//! use wirelink::protocol::{build_signal, BufferPool, Message, MessageType, Payload};
//!
//! let pool = BufferPool::new(256, 4);
//! let frame = build_signal(Some(b"news"), &Payload::utf8("hello")).unwrap();
//! let msg = Message::copy_from(&frame, &pool).unwrap();
//!
//! assert_eq!(msg.message_type(), MessageType::SignalUtf8);
//! assert_eq!(msg.name(), Some(&b"news"[..]));
//! assert_eq!(msg.payload_str().unwrap(), "hello");
//! msg.release();
//! ```

use std::ops::Range;

use bytes::Bytes;

use super::buffer_pool::{BufferPool, PooledBuffer};
use super::wire_format::{
    Encoding, Identifier, MessageType, ServerConfiguration, IDENTIFIER_SIZE,
};
use crate::error::{Result, WireError};

/// An outbound payload with its encoding tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// Encoding of `data`.
    pub encoding: Encoding,
    /// Encoded bytes.
    pub data: Bytes,
}

impl Payload {
    /// Create a payload from parts.
    pub fn new(encoding: Encoding, data: impl Into<Bytes>) -> Self {
        Self {
            encoding,
            data: data.into(),
        }
    }

    /// Binary payload.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(Encoding::Binary, data)
    }

    /// UTF-8 payload.
    pub fn utf8(text: impl Into<String>) -> Self {
        Self::new(Encoding::Utf8, text.into().into_bytes())
    }

    /// UTF-16 payload (little endian code units).
    pub fn utf16(text: &str) -> Self {
        let data: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
        Self::new(Encoding::Utf16, data)
    }

    /// Empty binary payload.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Check if the payload carries no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A decoded inbound frame.
pub struct Message {
    msg_type: MessageType,
    identifier: Option<Identifier>,
    name: Option<Range<usize>>,
    payload: Range<usize>,
    buffer: PooledBuffer,
}

impl Message {
    /// Decode the frame held in `buffer`.
    ///
    /// On failure the buffer is released back to its pool and a
    /// `MalformedMessage` error is returned.
    pub fn parse(buffer: PooledBuffer) -> Result<Self> {
        match Self::layout(&buffer) {
            Ok((msg_type, identifier, name, payload)) => Ok(Self {
                msg_type,
                identifier,
                name,
                payload,
                buffer,
            }),
            Err(err) => {
                buffer.release();
                Err(err)
            }
        }
    }

    /// Decode the frame held in `buffer`, rejecting frames longer than
    /// `limit` bytes with a `ProtocolViolation`.
    ///
    /// Both peers agree on the limit during the handshake, so an oversized
    /// frame means the peer broke the agreement. The grown buffer is dropped
    /// rather than pooled.
    pub fn parse_within(buffer: PooledBuffer, limit: usize) -> Result<Self> {
        if buffer.len() > limit {
            return Err(WireError::ProtocolViolation(format!(
                "frame of {} bytes exceeds the message buffer size of {} bytes",
                buffer.len(),
                limit
            )));
        }
        Self::parse(buffer)
    }

    /// Copy `frame` into a buffer from `pool` and decode it.
    pub fn copy_from(frame: &[u8], pool: &BufferPool) -> Result<Self> {
        let mut buffer = pool.acquire();
        buffer.extend_from_slice(frame);
        Self::parse(buffer)
    }

    #[allow(clippy::type_complexity)]
    fn layout(
        buf: &[u8],
    ) -> Result<(
        MessageType,
        Option<Identifier>,
        Option<Range<usize>>,
        Range<usize>,
    )> {
        let type_byte = *buf
            .first()
            .ok_or_else(|| WireError::MalformedMessage("empty frame".to_string()))?;
        let msg_type = MessageType::from_byte(type_byte).ok_or_else(|| {
            WireError::MalformedMessage(format!("unknown message type 0x{:02x}", type_byte))
        })?;

        let mut pos = 1;

        let identifier = if msg_type.has_identifier() {
            let end = pos + IDENTIFIER_SIZE;
            if buf.len() < end {
                return Err(WireError::MalformedMessage(format!(
                    "truncated identifier in {:?} frame",
                    msg_type
                )));
            }
            let mut id = [0u8; IDENTIFIER_SIZE];
            id.copy_from_slice(&buf[pos..end]);
            pos = end;
            Some(Identifier::from_bytes(id))
        } else {
            None
        };

        let name = if msg_type.has_name() {
            let len = *buf.get(pos).ok_or_else(|| {
                WireError::MalformedMessage(format!(
                    "missing name length in {:?} frame",
                    msg_type
                ))
            })? as usize;
            pos += 1;
            let end = pos + len;
            if buf.len() < end {
                return Err(WireError::MalformedMessage(format!(
                    "truncated name in {:?} frame (declared {} bytes)",
                    msg_type, len
                )));
            }
            let range = pos..end;
            pos = end;
            (len > 0).then_some(range)
        } else {
            None
        };

        let payload = pos..buf.len();

        if msg_type.encoding() == Encoding::Utf16 && payload.len() % 2 != 0 {
            return Err(WireError::MalformedMessage(format!(
                "odd UTF-16 payload length {}",
                payload.len()
            )));
        }

        Ok((msg_type, identifier, name, payload))
    }

    /// Message type.
    #[inline]
    pub fn message_type(&self) -> MessageType {
        self.msg_type
    }

    /// Correlation identifier (request and reply types only).
    #[inline]
    pub fn identifier(&self) -> Option<Identifier> {
        self.identifier
    }

    /// Message name, if present and non-empty.
    ///
    /// On error replies this is the error code.
    #[inline]
    pub fn name(&self) -> Option<&[u8]> {
        self.name.clone().map(|range| &self.buffer[range])
    }

    /// Message name as text (lossy).
    pub fn name_lossy(&self) -> String {
        self.name()
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .unwrap_or_default()
    }

    /// Payload encoding.
    #[inline]
    pub fn encoding(&self) -> Encoding {
        self.msg_type.encoding()
    }

    /// Raw payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.payload.clone()]
    }

    /// Payload as a validated UTF-8 string.
    ///
    /// Fails with `DecodingFailure` on UTF-16 payloads or invalid UTF-8.
    pub fn payload_str(&self) -> Result<&str> {
        if self.encoding() == Encoding::Utf16 {
            return Err(WireError::DecodingFailure(
                "payload is UTF-16 encoded".to_string(),
            ));
        }
        std::str::from_utf8(self.payload())
            .map_err(|e| WireError::DecodingFailure(format!("invalid UTF-8 payload: {}", e)))
    }

    /// Payload decoded to an owned string according to its encoding.
    pub fn payload_string(&self) -> Result<String> {
        match self.encoding() {
            Encoding::Utf16 => {
                let units: Vec<u16> = self
                    .payload()
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16(&units).map_err(|e| {
                    WireError::DecodingFailure(format!("invalid UTF-16 payload: {}", e))
                })
            }
            _ => self.payload_str().map(str::to_owned),
        }
    }

    /// Copy the payload out of the pooled buffer.
    pub fn payload_owned(&self) -> Payload {
        Payload::new(self.encoding(), Bytes::copy_from_slice(self.payload()))
    }

    /// Decode the accept-configuration payload.
    pub fn server_configuration(&self) -> Result<ServerConfiguration> {
        if self.msg_type != MessageType::AcceptConfiguration {
            return Err(WireError::ProtocolViolation(format!(
                "expected accept-configuration, got {:?}",
                self.msg_type
            )));
        }
        ServerConfiguration::decode(self.payload())
    }

    /// Hand the buffer back to its pool. The message is consumed.
    pub fn release(self) {
        self.buffer.release();
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.msg_type)
            .field("identifier", &self.identifier)
            .field("name", &self.name_lossy())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{build_error_reply, build_heartbeat, build_request};

    fn pool() -> BufferPool {
        BufferPool::new(128, 8)
    }

    #[test]
    fn test_parse_request() {
        let id = Identifier::from_u64(7);
        let frame = build_request(id, Some(b"auth"), &Payload::utf8("alice:secret")).unwrap();
        let msg = Message::copy_from(&frame, &pool()).unwrap();

        assert_eq!(msg.message_type(), MessageType::RequestUtf8);
        assert_eq!(msg.identifier(), Some(id));
        assert_eq!(msg.name(), Some(&b"auth"[..]));
        assert_eq!(msg.payload_str().unwrap(), "alice:secret");
    }

    #[test]
    fn test_parse_empty_frame() {
        let err = Message::copy_from(&[], &pool()).unwrap_err();
        assert!(matches!(err, WireError::MalformedMessage(_)));
    }

    #[test]
    fn test_parse_unknown_type() {
        let err = Message::copy_from(&[0xEE, 1, 2], &pool()).unwrap_err();
        assert!(err.to_string().contains("unknown message type 0xee"));
    }

    #[test]
    fn test_parse_truncated_identifier() {
        let err = Message::copy_from(&[MessageType::ReplyBinary.as_byte(), 0, 0, 1], &pool())
            .unwrap_err();
        assert!(err.to_string().contains("truncated identifier"));
    }

    #[test]
    fn test_parse_truncated_name() {
        let mut frame = vec![MessageType::SignalBinary.as_byte(), 10];
        frame.extend_from_slice(b"abc");
        let err = Message::copy_from(&frame, &pool()).unwrap_err();
        assert!(err.to_string().contains("truncated name"));
    }

    #[test]
    fn test_parse_failure_releases_buffer() {
        let pool = pool();
        let _ = Message::copy_from(&[0xEE], &pool);
        assert_eq!(pool.pooled_count(), 1);
    }

    #[test]
    fn test_frame_at_limit_is_accepted() {
        let pool = pool();
        let mut buffer = pool.acquire();
        buffer.extend_from_slice(&[MessageType::SignalBinary.as_byte(), 0]);
        buffer.resize(128, 0xAB);

        let msg = Message::parse_within(buffer, 128).unwrap();
        assert_eq!(msg.payload().len(), 126);
        msg.release();
        assert_eq!(pool.pooled_count(), 1);
    }

    #[test]
    fn test_frame_over_limit_is_violation() {
        let pool = pool();
        let mut buffer = pool.acquire();
        buffer.extend_from_slice(&[MessageType::SignalBinary.as_byte(), 0]);
        buffer.resize(129, 0xAB);

        let err = Message::parse_within(buffer, 128).unwrap_err();
        assert!(matches!(err, WireError::ProtocolViolation(_)));
        assert!(err.to_string().contains("129 bytes"));
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn test_odd_utf16_payload_rejected() {
        let frame = [MessageType::SignalUtf16.as_byte(), 0, b'a', b'b', b'c'];
        let err = Message::copy_from(&frame, &pool()).unwrap_err();
        assert!(err.to_string().contains("odd UTF-16"));
    }

    #[test]
    fn test_invalid_utf8_is_decoding_failure() {
        let frame = [MessageType::SignalUtf8.as_byte(), 0, 0xFF, 0xFE];
        let msg = Message::copy_from(&frame, &pool()).unwrap();
        assert!(matches!(
            msg.payload_str(),
            Err(WireError::DecodingFailure(_))
        ));
    }

    #[test]
    fn test_utf16_payload_string() {
        let frame = build_request(Identifier::from_u64(1), Some(b"x"), &Payload::utf16("héllo"))
            .unwrap();
        let msg = Message::copy_from(&frame, &pool()).unwrap();
        assert_eq!(msg.encoding(), Encoding::Utf16);
        assert_eq!(msg.payload_string().unwrap(), "héllo");
        assert!(msg.payload_str().is_err());
    }

    #[test]
    fn test_error_reply_name_is_code() {
        let frame = build_error_reply(Identifier::from_u64(3), "BAD_REQUEST", "nope").unwrap();
        let msg = Message::copy_from(&frame, &pool()).unwrap();
        assert_eq!(msg.message_type(), MessageType::ReplyError);
        assert_eq!(msg.name_lossy(), "BAD_REQUEST");
        assert_eq!(msg.payload_str().unwrap(), "nope");
    }

    #[test]
    fn test_heartbeat_has_no_fields() {
        let msg = Message::copy_from(&build_heartbeat(), &pool()).unwrap();
        assert_eq!(msg.message_type(), MessageType::Heartbeat);
        assert!(msg.identifier().is_none());
        assert!(msg.name().is_none());
        assert!(msg.payload().is_empty());
    }

    #[test]
    fn test_release_returns_buffer() {
        let pool = pool();
        let msg = Message::copy_from(&build_heartbeat(), &pool).unwrap();
        assert_eq!(pool.pooled_count(), 0);
        msg.release();
        assert_eq!(pool.pooled_count(), 1);
    }

    #[test]
    fn test_server_configuration_on_wrong_type() {
        let msg = Message::copy_from(&build_heartbeat(), &pool()).unwrap();
        assert!(matches!(
            msg.server_configuration(),
            Err(WireError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_payload_constructors() {
        assert_eq!(Payload::utf8("a").encoding, Encoding::Utf8);
        assert_eq!(Payload::utf16("a").data.as_ref(), &[b'a', 0]);
        assert!(Payload::empty().is_empty());
    }
}
