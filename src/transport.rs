//! Transport trait for link connections

use tokio_util::bytes::Bytes;

use crate::error::{ConnectError, ReceiveError, SendError};

/// One physical connection: to the animation tool or to the robot controller.
///
/// Transports handle mechanics only. They never reconnect on their own; a
/// failure is returned to the caller and the link's
/// [`Supervisor`](crate::supervisor::Supervisor) decides what happens next.
///
/// All methods take `&self` so a receive loop and a send loop can share one
/// transport through an `Arc` and block independently.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the connection to `address` (`host:port`).
    ///
    /// An existing connection is closed first.
    async fn connect(&self, address: &str) -> Result<(), ConnectError>;

    /// Write one message.
    ///
    /// Stream transports frame the message and keep writing until every byte
    /// is flushed; datagram transports send it as a single datagram.
    async fn send(&self, message: Bytes) -> Result<(), SendError>;

    /// Wait for the next message.
    ///
    /// Returns:
    /// - `Ok(message)` - one complete message, framing removed
    /// - `Err(ReceiveError::Timeout)` - nothing arrived within the read timeout
    /// - `Err(ReceiveError::ConnectionReset)` - the link is gone
    /// - `Err(ReceiveError::Malformed)` - input was dropped at the framing level
    async fn receive(&self) -> Result<Bytes, ReceiveError>;

    /// Release the connection. Safe to call when already closed.
    async fn close(&self);

    /// Short label for logs ("tcp", "udp", ...)
    fn kind(&self) -> &'static str;
}
