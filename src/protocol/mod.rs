//! Protocol module - wire format, message decoding and frame builders.
//!
//! This module implements the binary message model shared by client and server:
//! - type byte, identifier and name header encoding/decoding
//! - pooled inbound buffers with explicit release
//! - frame builders for every outbound kind

mod buffer_pool;
mod frame;
mod message;
mod wire_format;

pub use buffer_pool::{BufferPool, PooledBuffer, DEFAULT_MAX_POOLED};
pub use frame::{
    build_accept_configuration, build_close_session, build_error_reply, build_heartbeat,
    build_reply, build_request, build_restore_session, build_session_closed,
    build_session_created, build_signal, build_special_reply,
};
pub use message::{Message, Payload};
pub use wire_format::{
    Encoding, Identifier, MessageType, ServerConfiguration, IDENTIFIER_SIZE, MAX_NAME_LENGTH,
    PROTOCOL_MAJOR_VERSION, PROTOCOL_MINOR_VERSION, SERVER_CONFIGURATION_SIZE,
};
