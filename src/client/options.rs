//! Client options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WireError};
use crate::server::{DEFAULT_MESSAGE_BUFFER_SIZE, MIN_MESSAGE_BUFFER_SIZE};

/// Default deadline for dialing plus the accept-configuration handshake.
pub const DEFAULT_DIALING_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for a request, including any reconnection it waits for.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default pause between reconnection attempts.
pub const DEFAULT_RECONNECTION_INTERVAL: Duration = Duration::from_secs(2);

/// Automatic reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Autoconnect {
    /// Reconnect in the background and on demand.
    #[default]
    Enabled,
    /// Never reconnect; operations fail with `Disconnected` instead.
    Disabled,
}

/// Client configuration.
///
/// ```
/// use wirelink::client::{Autoconnect, ClientOptions};
///
/// let opts: ClientOptions =
///     serde_json::from_str(r#"{"autoconnect": "disabled", "dialing_timeout": 250}"#).unwrap();
/// assert_eq!(opts.autoconnect, Autoconnect::Disabled);
/// assert_eq!(opts.dialing_timeout.as_millis(), 250);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Deadline for dial and handshake.
    #[serde(with = "crate::duration_ms")]
    pub dialing_timeout: Duration,
    /// Deadline for requests without an explicit timeout.
    #[serde(with = "crate::duration_ms")]
    pub default_request_timeout: Duration,
    /// Pause between reconnection attempts.
    #[serde(with = "crate::duration_ms")]
    pub reconnection_interval: Duration,
    /// Automatic reconnection policy.
    pub autoconnect: Autoconnect,
    /// Must equal the server's message buffer size.
    pub message_buffer_size: u32,
    /// Must equal the server's sub-protocol name.
    pub sub_protocol_name: Option<String>,
    /// Send heartbeats at half the server's read timeout.
    pub heartbeat: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            dialing_timeout: DEFAULT_DIALING_TIMEOUT,
            default_request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnection_interval: DEFAULT_RECONNECTION_INTERVAL,
            autoconnect: Autoconnect::Enabled,
            message_buffer_size: DEFAULT_MESSAGE_BUFFER_SIZE,
            sub_protocol_name: None,
            heartbeat: true,
        }
    }
}

impl ClientOptions {
    /// Validate the options.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOptions` describing the first offending field.
    pub fn prepare(&self) -> Result<()> {
        if self.dialing_timeout.is_zero() {
            return Err(WireError::InvalidOptions(
                "dialing_timeout must be positive".to_string(),
            ));
        }
        if self.default_request_timeout.is_zero() {
            return Err(WireError::InvalidOptions(
                "default_request_timeout must be positive".to_string(),
            ));
        }
        if self.message_buffer_size < MIN_MESSAGE_BUFFER_SIZE {
            return Err(WireError::InvalidOptions(format!(
                "message_buffer_size must be at least {} (got {})",
                MIN_MESSAGE_BUFFER_SIZE, self.message_buffer_size
            )));
        }
        Ok(())
    }
}
