//! Error types for the bridge.
//!
//! Errors are split by where they arise so that each layer only handles what it
//! can act on:
//!
//! - [`DecodeError`]: a single message or packet was unusable; discard and count
//! - [`ConnectError`]: a connect attempt failed; the supervisor backs off
//! - [`SendError`] / [`ReceiveError`]: transport failures; reported to the supervisor
//! - [`BridgeError`]: umbrella type returned by the public API
//!
//! ```rust
//! use motionbridge::{BridgeError, ConnectError};
//!
//! let error = BridgeError::from(ConnectError::Refused { address: "127.0.0.1:49152".into() });
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// A message or packet could not be turned into a typed value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Malformed message: {details}")]
    Malformed { details: String },

    #[error("Checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("Axis count mismatch: expected {expected}, found {found}")]
    ArityMismatch { expected: usize, found: usize },
}

impl DecodeError {
    /// Helper constructor for malformed input.
    pub fn malformed(details: impl Into<String>) -> Self {
        DecodeError::Malformed { details: details.into() }
    }

    /// Short, stable label for counters and events.
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::Malformed { .. } => "malformed",
            DecodeError::ChecksumMismatch { .. } => "checksum_mismatch",
            DecodeError::ArityMismatch { .. } => "arity_mismatch",
        }
    }
}

/// A connect attempt failed.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Host unreachable: {address}")]
    Unreachable {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection refused by {address}")]
    Refused { address: String },

    #[error("Connect to {address} timed out after {duration:?}")]
    Timeout { address: String, duration: Duration },

    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
}

impl ConnectError {
    /// Classify an I/O error raised while connecting to `address`.
    pub fn from_io(address: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectError::Refused { address: address.to_string() },
            io::ErrorKind::InvalidInput => {
                ConnectError::InvalidAddress { address: address.to_string(), reason: err.to_string() }
            }
            _ => ConnectError::Unreachable { address: address.to_string(), source: err },
        }
    }
}

/// Writing to a link failed.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("Link is not connected")]
    NotConnected,

    #[error("Broken pipe after writing {written} of {total} bytes")]
    BrokenPipe { written: usize, total: usize },

    #[error("Write stalled for {duration:?}")]
    Timeout { duration: Duration },

    #[error("Send failed")]
    Io(#[source] io::Error),
}

impl From<io::Error> for SendError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotConnected => SendError::NotConnected,
            _ => SendError::Io(err),
        }
    }
}

/// Reading from a link failed.
#[derive(Error, Debug)]
pub enum ReceiveError {
    #[error("No data within {duration:?}")]
    Timeout { duration: Duration },

    #[error("Connection reset: {reason}")]
    ConnectionReset { reason: String },

    #[error("Malformed input: {details}")]
    Malformed { details: String },

    #[error("Link is not connected")]
    NotConnected,
}

impl ReceiveError {
    /// Whether the link should be treated as lost.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReceiveError::ConnectionReset { .. })
    }
}

impl From<io::Error> for ReceiveError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotConnected => ReceiveError::NotConnected,
            io::ErrorKind::InvalidData => ReceiveError::Malformed { details: err.to_string() },
            _ => ReceiveError::ConnectionReset { reason: err.to_string() },
        }
    }
}

/// Main error type for bridge operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BridgeError {
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Receive(#[from] ReceiveError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl BridgeError {
    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        BridgeError::Config { reason: reason.into() }
    }

    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Config { .. } => false,
            BridgeError::Connect(ConnectError::InvalidAddress { .. }) => false,
            BridgeError::Connect(_) => true,
            BridgeError::Send(_) => true,
            BridgeError::Receive(ReceiveError::Malformed { .. }) => false,
            BridgeError::Receive(_) => true,
            BridgeError::Decode(_) => false,
            BridgeError::Io(_) => true,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            BridgeError::Config { .. } => vec![
                "Check the configuration file against the documented fields",
                "Make sure axis_count matches the robot's degrees of freedom",
            ],
            BridgeError::Connect(_) => vec![
                "Check that the peer application is running and listening",
                "Verify host and port in the configuration",
                "Check firewall rules between bridge and peer",
            ],
            BridgeError::Send(_) | BridgeError::Receive(_) | BridgeError::Io(_) => vec![
                "Check network cabling and the peer's status",
                "The supervisor will reconnect automatically",
            ],
            BridgeError::Decode(DecodeError::ArityMismatch { .. }) => vec![
                "Configure axis_count to match the animation rig",
                "Check the animation tool sends one value per robot axis",
            ],
            BridgeError::Decode(_) => vec![
                "Check the peer speaks the expected protocol version",
                "Inspect the link for corruption",
            ],
        }
    }
}
