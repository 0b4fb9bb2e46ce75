//! Error types for wirelink.
//!
//! A single [`WireError`] enum covers every failure surfaced by the client,
//! the server and the transport contract. It is `Clone` because a single
//! reconnection failure is handed to every caller waiting on the connection.

use std::sync::Arc;

use thiserror::Error;

/// Main error type for all wirelink operations.
#[derive(Debug, Clone, Error)]
pub enum WireError {
    /// The socket is gone or could not be established. Retryable.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// A frame could not be decoded (truncated header, unknown type byte).
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A well-formed frame that is not allowed in the current state.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The server speaks an incompatible major protocol version.
    #[error("Incompatible protocol version: server {server}, supported {supported}")]
    IncompatibleProtocolVersion {
        /// Version advertised by the server (`major.minor`).
        server: String,
        /// Version range supported by this client.
        supported: String,
    },

    /// Client and server sub-protocol names differ.
    #[error("Mismatching sub-protocols (client: {client:?}; server: {server:?})")]
    SubProtocolMismatch {
        /// Client-side sub-protocol name.
        client: Option<String>,
        /// Server-side sub-protocol name.
        server: Option<String>,
    },

    /// Client and server message buffer sizes differ.
    #[error("Mismatching message buffer size (client: {client}; server: {server})")]
    BufferSizeMismatch {
        /// Client-side buffer size.
        client: u32,
        /// Server-advertised buffer size.
        server: u32,
    },

    /// The caller's deadline expired.
    #[error("Timed out")]
    Timeout,

    /// The caller canceled the operation.
    #[error("Canceled")]
    Canceled,

    /// A session is already attached to the connection.
    #[error("Session conflict: {0}")]
    SessionConflict(String),

    /// Sessions are disabled on the server.
    #[error("Sessions are disabled")]
    SessionsDisabled,

    /// The session key is unknown to the server.
    #[error("Session not found")]
    SessionNotFound,

    /// The session already has the maximum number of connections.
    #[error("Maximum number of session connections reached")]
    MaxSessionConnectionsReached,

    /// Application-level rejection, surfaced verbatim.
    #[error("Request error {code}: {message}")]
    Request {
        /// Error code chosen by the server application.
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// The server failed internally while handling the request.
    #[error("Internal server error")]
    Internal,

    /// The server is shutting down and refused the request.
    #[error("Server is shutting down")]
    ServerShutdown,

    /// A payload could not be decoded with its declared encoding.
    #[error("Decoding failure: {0}")]
    DecodingFailure(String),

    /// A frame could not be written to the socket.
    #[error("Transmission failed: {0}")]
    Transmission(String),

    /// I/O error from the transport.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// JSON serialization/deserialization error (session objects).
    #[error("JSON error: {0}")]
    Json(String),

    /// Options failed validation.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
}

impl WireError {
    /// Shorthand for an application-level request error.
    pub fn request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Request {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Check if this error means the connection is (temporarily) unavailable.
    ///
    /// The reconnection supervisor keeps retrying on these and gives up on
    /// everything else.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }

    /// Check if this error is a handshake disagreement.
    #[inline]
    pub fn is_handshake_mismatch(&self) -> bool {
        matches!(
            self,
            Self::IncompatibleProtocolVersion { .. }
                | Self::SubProtocolMismatch { .. }
                | Self::BufferSizeMismatch { .. }
        )
    }
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for WireError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Result type alias using WireError.
pub type Result<T> = std::result::Result<T, WireError>;
