//! Real-time bridge between an animation tool and an industrial robot controller.
//!
//! Motionbridge reads poses from an animation tool's command port (TCP, one
//! text command per line), paces them to the robot's control period, and
//! sends them to the robot controller as checksummed binary packets over UDP
//! or TCP. Telemetry from the robot flows back into an observable session and,
//! optionally, as acknowledgement lines to the animation tool.
//!
//! # Features
//!
//! - **Independent links**: each link has its own supervisor with backoff and
//!   liveness detection; one failing link never stalls the other
//! - **Latest value wins**: a single-slot buffer and a fixed-rate governor
//!   keep the robot on the newest pose without queueing
//! - **Observable**: session snapshots as a [`Stream`](futures::Stream) and
//!   structured [`BridgeEvent`]s through an injected [`EventSink`]
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use motionbridge::{BridgeConfig, MotionBridge, TracingSink};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> motionbridge::Result<()> {
//!     let config = BridgeConfig::from_yaml_str("axis_count: 6")?;
//!     let bridge = MotionBridge::connect(config, Arc::new(TracingSink))?;
//!
//!     let mut updates = Box::pin(bridge.session().updates());
//!     while let Some(state) = updates.next().await {
//!         println!("robot {} sent {}", state.robot.state, state.counters.frames_sent);
//!     }
//!
//!     bridge.shutdown().await;
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod codec;
pub mod config;
mod error;
pub mod events;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Links
pub mod supervisor;
pub mod transport;
pub mod transports;

// Pipeline
pub mod bridge;
pub mod session;
pub mod stream;

use std::sync::Arc;

// Core exports
pub use error::*;
pub use types::*;

// Main API exports
pub use bridge::{Bridge, BridgeHandle};
pub use config::{BridgeConfig, IdlePolicy, RobotTransportKind};
pub use events::{BridgeEvent, EventSink, TracingSink};
pub use session::{BridgeCounters, SessionHandle, SessionState};
pub use transport::Transport;
pub use transports::{DatagramTransport, StreamFraming, StreamTransport};

/// Unified entry point that builds transports from configuration.
///
/// Use [`Bridge::start`] directly to run over custom [`Transport`]s.
pub struct MotionBridge;

impl MotionBridge {
    /// Start a bridge over the transports described by `config`.
    ///
    /// The animation link is always a TCP line stream. The robot link is a UDP
    /// socket bound to `robot.bind_address`, or a length-prefixed TCP stream.
    /// Returns immediately; the links connect in the background.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if the configuration is invalid.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use motionbridge::{BridgeConfig, MotionBridge, TracingSink};
    /// use std::sync::Arc;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> motionbridge::Result<()> {
    /// let bridge = MotionBridge::connect(BridgeConfig::default(), Arc::new(TracingSink))?;
    /// bridge.shutdown().await;
    /// # Ok(())
    /// # }
    /// ```
    pub fn connect(config: BridgeConfig, sink: Arc<dyn EventSink>) -> Result<BridgeHandle> {
        config.validate()?;

        let animation = Arc::new(StreamTransport::new(
            StreamFraming::Lines { max_length: config.animation.max_line_length },
            config.animation.link.read_timeout(),
        ));
        let read_timeout = config.robot.link.read_timeout();
        let robot: Arc<dyn Transport> = match config.robot.transport {
            RobotTransportKind::Udp => Arc::new(DatagramTransport::new(config.robot.bind_addr()?, read_timeout)),
            RobotTransportKind::Tcp => Arc::new(StreamTransport::new(StreamFraming::LengthPrefixed, read_timeout)),
        };

        Bridge::start(config, animation, robot, sink)
    }
}
