//! Wire format constants and header primitives.
//!
//! Every frame starts with a single type byte. The remaining header fields
//! depend on the type:
//! ```text
//! ┌──────┬──────────────┬──────────┬──────────┬─────────────┐
//! │ Type │ Identifier   │ Name len │ Name     │ Payload     │
//! │ 1 B  │ 8 B (req/rep)│ 1 B (opt)│ 0-255 B  │ rest        │
//! └──────┴──────────────┴──────────┴──────────┴─────────────┘
//! ```
//!
//! Identifiers are present on request and reply types only. Names are present
//! on data requests, signals and error replies (where they carry the error
//! code). All multi-byte integers are Big Endian.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};

/// Major protocol version. Peers must match exactly.
pub const PROTOCOL_MAJOR_VERSION: u8 = 2;

/// Minor protocol version. Informational only.
pub const PROTOCOL_MINOR_VERSION: u8 = 0;

/// Size of a request/reply identifier in bytes.
pub const IDENTIFIER_SIZE: usize = 8;

/// Maximum length of a message name.
pub const MAX_NAME_LENGTH: usize = u8::MAX as usize;

/// Size of the fixed part of the accept-configuration payload.
pub const SERVER_CONFIGURATION_SIZE: usize = 11;

/// Payload encoding tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    /// Opaque bytes.
    #[default]
    Binary,
    /// UTF-8 text.
    Utf8,
    /// UTF-16 text (even number of bytes).
    Utf16,
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binary => f.write_str("binary"),
            Self::Utf8 => f.write_str("utf8"),
            Self::Utf16 => f.write_str("utf16"),
        }
    }
}

/// Message type, encoded as the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Server handshake carrying the negotiated configuration.
    AcceptConfiguration = 0x01,
    /// Client liveness probe.
    Heartbeat = 0x02,
    /// Server notifies the client about a new session.
    NotifySessionCreated = 0x10,
    /// Server notifies the client that its session was closed.
    NotifySessionClosed = 0x11,
    /// Client asks to restore a session by key.
    RequestRestoreSession = 0x20,
    /// Client asks to close its session.
    RequestCloseSession = 0x21,
    /// Named request with binary payload.
    RequestBinary = 0x22,
    /// Named request with UTF-8 payload.
    RequestUtf8 = 0x23,
    /// Named request with UTF-16 payload.
    RequestUtf16 = 0x24,
    /// Successful reply with binary payload.
    ReplyBinary = 0x30,
    /// Successful reply with UTF-8 payload.
    ReplyUtf8 = 0x31,
    /// Successful reply with UTF-16 payload.
    ReplyUtf16 = 0x32,
    /// Application error reply, name = code, payload = message.
    ReplyError = 0x33,
    /// Handler failed internally.
    ReplyInternalError = 0x34,
    /// Server is shutting down.
    ReplyShutdown = 0x35,
    /// Unknown session key.
    ReplySessionNotFound = 0x36,
    /// Session connection limit reached.
    ReplyMaxSessionConnectionsReached = 0x37,
    /// Sessions are disabled.
    ReplySessionsDisabled = 0x38,
    /// Signal with binary payload.
    SignalBinary = 0x40,
    /// Signal with UTF-8 payload.
    SignalUtf8 = 0x41,
    /// Signal with UTF-16 payload.
    SignalUtf16 = 0x42,
}

impl MessageType {
    /// Parse a type byte. Returns `None` for unknown values.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => Self::AcceptConfiguration,
            0x02 => Self::Heartbeat,
            0x10 => Self::NotifySessionCreated,
            0x11 => Self::NotifySessionClosed,
            0x20 => Self::RequestRestoreSession,
            0x21 => Self::RequestCloseSession,
            0x22 => Self::RequestBinary,
            0x23 => Self::RequestUtf8,
            0x24 => Self::RequestUtf16,
            0x30 => Self::ReplyBinary,
            0x31 => Self::ReplyUtf8,
            0x32 => Self::ReplyUtf16,
            0x33 => Self::ReplyError,
            0x34 => Self::ReplyInternalError,
            0x35 => Self::ReplyShutdown,
            0x36 => Self::ReplySessionNotFound,
            0x37 => Self::ReplyMaxSessionConnectionsReached,
            0x38 => Self::ReplySessionsDisabled,
            0x40 => Self::SignalBinary,
            0x41 => Self::SignalUtf8,
            0x42 => Self::SignalUtf16,
            _ => return None,
        })
    }

    /// The type byte.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Request type carrying the given payload encoding.
    pub fn request(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Binary => Self::RequestBinary,
            Encoding::Utf8 => Self::RequestUtf8,
            Encoding::Utf16 => Self::RequestUtf16,
        }
    }

    /// Reply type carrying the given payload encoding.
    pub fn reply(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Binary => Self::ReplyBinary,
            Encoding::Utf8 => Self::ReplyUtf8,
            Encoding::Utf16 => Self::ReplyUtf16,
        }
    }

    /// Signal type carrying the given payload encoding.
    pub fn signal(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Binary => Self::SignalBinary,
            Encoding::Utf8 => Self::SignalUtf8,
            Encoding::Utf16 => Self::SignalUtf16,
        }
    }

    /// Check if frames of this type carry an 8-byte identifier.
    #[inline]
    pub fn has_identifier(self) -> bool {
        self.is_request() || self.is_reply()
    }

    /// Check if frames of this type carry a length-prefixed name.
    #[inline]
    pub fn has_name(self) -> bool {
        matches!(
            self,
            Self::RequestBinary
                | Self::RequestUtf8
                | Self::RequestUtf16
                | Self::ReplyError
                | Self::SignalBinary
                | Self::SignalUtf8
                | Self::SignalUtf16
        )
    }

    /// Check if this is any client request (including session requests).
    #[inline]
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::RequestRestoreSession
                | Self::RequestCloseSession
                | Self::RequestBinary
                | Self::RequestUtf8
                | Self::RequestUtf16
        )
    }

    /// Check if this is any reply.
    #[inline]
    pub fn is_reply(self) -> bool {
        (self as u8) & 0xF0 == 0x30
    }

    /// Check if this is a successful data reply.
    #[inline]
    pub fn is_data_reply(self) -> bool {
        matches!(self, Self::ReplyBinary | Self::ReplyUtf8 | Self::ReplyUtf16)
    }

    /// Check if this is a signal.
    #[inline]
    pub fn is_signal(self) -> bool {
        matches!(
            self,
            Self::SignalBinary | Self::SignalUtf8 | Self::SignalUtf16
        )
    }

    /// Payload encoding implied by the type.
    pub fn encoding(self) -> Encoding {
        match self {
            Self::RequestUtf8
            | Self::ReplyUtf8
            | Self::SignalUtf8
            | Self::ReplyError
            | Self::NotifySessionCreated => Encoding::Utf8,
            Self::RequestUtf16 | Self::ReplyUtf16 | Self::SignalUtf16 => Encoding::Utf16,
            _ => Encoding::Binary,
        }
    }
}

/// Correlation token linking a reply to its request.
///
/// The all-zero identifier is never allocated for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Identifier([u8; IDENTIFIER_SIZE]);

impl Identifier {
    /// The zero identifier.
    pub const ZERO: Self = Self([0; IDENTIFIER_SIZE]);

    /// Create an identifier from a counter value.
    #[inline]
    pub fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    /// Create an identifier from raw bytes.
    #[inline]
    pub fn from_bytes(bytes: [u8; IDENTIFIER_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; IDENTIFIER_SIZE] {
        &self.0
    }

    /// Counter value.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    /// Check if this is the zero identifier.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; IDENTIFIER_SIZE]
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.as_u64())
    }
}

/// Server parameters announced in the accept-configuration handshake.
///
/// Payload layout:
/// ```text
/// ┌───────┬───────┬──────────────┬─────────────┬─────┬──────────────┐
/// │ Major │ Minor │ Read timeout │ Buffer size │ Has │ Sub-protocol │
/// │ 1 B   │ 1 B   │ u32 BE (ms)  │ u32 BE      │ 1 B │ rest         │
/// └───────┴───────┴──────────────┴─────────────┴─────┴──────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfiguration {
    /// Major protocol version.
    pub major_protocol_version: u8,
    /// Minor protocol version.
    pub minor_protocol_version: u8,
    /// Server read deadline in milliseconds.
    pub read_timeout_ms: u32,
    /// Message buffer size both peers must use.
    pub message_buffer_size: u32,
    /// Optional sub-protocol name.
    pub sub_protocol_name: Option<Bytes>,
}

impl ServerConfiguration {
    /// Encode into the accept-configuration payload.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(
            SERVER_CONFIGURATION_SIZE + self.sub_protocol_name.as_ref().map_or(0, |n| n.len()),
        );
        buf.put_u8(self.major_protocol_version);
        buf.put_u8(self.minor_protocol_version);
        buf.put_u32(self.read_timeout_ms);
        buf.put_u32(self.message_buffer_size);
        match &self.sub_protocol_name {
            Some(name) => {
                buf.put_u8(1);
                buf.put_slice(name);
            }
            None => buf.put_u8(0),
        }
    }

    /// Decode from an accept-configuration payload.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SERVER_CONFIGURATION_SIZE {
            return Err(WireError::MalformedMessage(format!(
                "accept-configuration payload too short ({} bytes)",
                buf.len()
            )));
        }
        let sub_protocol_name = match buf[10] {
            0 => None,
            1 => Some(Bytes::copy_from_slice(&buf[SERVER_CONFIGURATION_SIZE..])),
            flag => {
                return Err(WireError::MalformedMessage(format!(
                    "invalid sub-protocol flag {}",
                    flag
                )))
            }
        };
        Ok(Self {
            major_protocol_version: buf[0],
            minor_protocol_version: buf[1],
            read_timeout_ms: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            message_buffer_size: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
            sub_protocol_name,
        })
    }
}
