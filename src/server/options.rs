//! Server and per-connection options.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::admission::DEFAULT_CONCURRENCY_LIMIT;
use crate::error::{Result, WireError};
use crate::protocol::{ServerConfiguration, PROTOCOL_MAJOR_VERSION, PROTOCOL_MINOR_VERSION};

/// Default size of message buffers, which both peers must agree on.
pub const DEFAULT_MESSAGE_BUFFER_SIZE: u32 = 8192;

/// Default deadline for reading the next frame from a client.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Smallest accepted message buffer size.
pub const MIN_MESSAGE_BUFFER_SIZE: u32 = 32;

/// Server configuration.
///
/// Loadable from JSON; durations are given in milliseconds.
///
/// ```
/// use wirelink::server::ServerOptions;
///
/// let opts: ServerOptions =
///     serde_json::from_str(r#"{"read_timeout": 5000, "sessions_enabled": false}"#).unwrap();
/// assert_eq!(opts.read_timeout.as_secs(), 5);
/// assert!(!opts.sessions_enabled);
/// assert_eq!(opts.message_buffer_size, 8192);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Allow connections to create and restore sessions.
    pub sessions_enabled: bool,
    /// Maximum connections sharing one session (0 = unlimited).
    pub max_session_connections: usize,
    /// Message buffer size announced in the handshake.
    pub message_buffer_size: u32,
    /// Optional sub-protocol name announced in the handshake.
    pub sub_protocol_name: Option<String>,
    /// Deadline for each read; clients heartbeat at half this interval.
    /// Zero disables the deadline.
    #[serde(with = "crate::duration_ms")]
    pub read_timeout: Duration,
    /// Concurrent handlers per connection unless `before_accept` says otherwise.
    pub default_concurrency_limit: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            sessions_enabled: true,
            max_session_connections: 0,
            message_buffer_size: DEFAULT_MESSAGE_BUFFER_SIZE,
            sub_protocol_name: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            default_concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
        }
    }
}

impl ServerOptions {
    /// Validate the options.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOptions` describing the first offending field.
    pub fn prepare(&self) -> Result<()> {
        if self.message_buffer_size < MIN_MESSAGE_BUFFER_SIZE {
            return Err(WireError::InvalidOptions(format!(
                "message_buffer_size must be at least {} (got {})",
                MIN_MESSAGE_BUFFER_SIZE, self.message_buffer_size
            )));
        }
        if self.read_timeout.as_millis() > u32::MAX as u128 {
            return Err(WireError::InvalidOptions(format!(
                "read_timeout too large ({:?})",
                self.read_timeout
            )));
        }
        Ok(())
    }

    /// Accept-configuration announced to every client.
    pub fn server_configuration(&self) -> ServerConfiguration {
        ServerConfiguration {
            major_protocol_version: PROTOCOL_MAJOR_VERSION,
            minor_protocol_version: PROTOCOL_MINOR_VERSION,
            read_timeout_ms: self.read_timeout.as_millis() as u32,
            message_buffer_size: self.message_buffer_size,
            sub_protocol_name: self
                .sub_protocol_name
                .as_ref()
                .map(|name| Bytes::copy_from_slice(name.as_bytes())),
        }
    }
}

/// Whether an inbound socket is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Acceptance {
    /// Perform the handshake and serve the connection.
    #[default]
    Accept,
    /// Close the socket without a handshake.
    Refuse,
}

/// Options decided per connection by `ServerImplementation::before_accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Accept or refuse.
    pub acceptance: Acceptance,
    /// Concurrent handlers for this connection (0 = unlimited). `None`
    /// uses the server's `default_concurrency_limit`.
    pub concurrency_limit: Option<usize>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            acceptance: Acceptance::Accept,
            concurrency_limit: None,
        }
    }
}

impl ConnectionOptions {
    /// Refuse the connection.
    pub fn refuse() -> Self {
        Self {
            acceptance: Acceptance::Refuse,
            ..Self::default()
        }
    }

    /// Accept with the given concurrency limit.
    pub fn with_concurrency_limit(limit: usize) -> Self {
        Self {
            acceptance: Acceptance::Accept,
            concurrency_limit: Some(limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ServerOptions::default();
        assert!(opts.sessions_enabled);
        assert_eq!(opts.max_session_connections, 0);
        assert_eq!(opts.read_timeout, Duration::from_secs(60));
        assert_eq!(opts.default_concurrency_limit, 256);
        assert!(opts.prepare().is_ok());
    }

    #[test]
    fn test_prepare_rejects_tiny_buffer() {
        let opts = ServerOptions {
            message_buffer_size: 4,
            ..Default::default()
        };
        assert!(matches!(opts.prepare(), Err(WireError::InvalidOptions(_))));
    }

    #[test]
    fn test_server_configuration() {
        let opts = ServerOptions {
            sub_protocol_name: Some("chat".to_string()),
            read_timeout: Duration::from_millis(1500),
            message_buffer_size: 1024,
            ..Default::default()
        };
        let conf = opts.server_configuration();
        assert_eq!(conf.major_protocol_version, PROTOCOL_MAJOR_VERSION);
        assert_eq!(conf.read_timeout_ms, 1500);
        assert_eq!(conf.message_buffer_size, 1024);
        assert_eq!(conf.sub_protocol_name.as_deref(), Some(&b"chat"[..]));
    }

    #[test]
    fn test_json_round_trip_uses_milliseconds() {
        let opts = ServerOptions::default();
        let json = serde_json::to_value(&opts).unwrap();
        assert_eq!(json["read_timeout"], 60_000);
    }

    #[test]
    fn test_connection_options() {
        assert_eq!(ConnectionOptions::refuse().acceptance, Acceptance::Refuse);
        assert_eq!(
            ConnectionOptions::with_concurrency_limit(4).concurrency_limit,
            Some(4)
        );
        assert_eq!(ConnectionOptions::default().concurrency_limit, None);
    }
}
