//! Per-invocation context handed to request and signal handlers.

use tokio_util::sync::CancellationToken;

use crate::protocol::Identifier;

/// Context passed to `on_request` and `on_signal`.
///
/// The cancellation token fires when the connection is torn down, so
/// long-running handlers can stop early.
///
/// # Example
///
/// ```ignore
/// async fn on_request(&self, ctx: RequestContext, conn: &Arc<Connection>, msg: &Message)
///     -> Result<Payload>
/// {
///     tokio::select! {
///         result = expensive_lookup(msg.payload()) => result,
///         _ = ctx.cancelled() => Err(WireError::Canceled),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RequestContext {
    identifier: Option<Identifier>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Create a context. Signals have no identifier.
    pub fn new(identifier: Option<Identifier>, cancel: CancellationToken) -> Self {
        Self { identifier, cancel }
    }

    /// Identifier of the request being handled.
    #[inline]
    pub fn identifier(&self) -> Option<Identifier> {
        self.identifier
    }

    /// Check if this context belongs to a signal.
    #[inline]
    pub fn is_signal(&self) -> bool {
        self.identifier.is_none()
    }

    /// Check if the handler should stop.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the handler should stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// The underlying token.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}
