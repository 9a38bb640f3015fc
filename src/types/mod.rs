//! Core types for motion data and link health.
//!
//! This module provides the data structures that flow through the bridge:
//!
//! - [`MotionFrame`] is one animator-tick pose, travelling animation → robot
//! - [`Telemetry`] is robot-reported state, travelling robot → bridge
//! - [`StatusFlags`] wraps the telemetry status bitfield
//! - [`ConnectionState`] / [`LinkStatus`] describe the health of one link
//!
//! ## Sequence numbers
//!
//! Frame sequences are `u32` counters compared with the half-range rule, so a
//! long-running session survives wraparound:
//!
//! ```rust
//! use motionbridge::types::{sequence_after, sequence_gap};
//!
//! assert!(sequence_after(2, 1));
//! assert!(sequence_after(0, u32::MAX));
//! assert_eq!(sequence_gap(1, 5), 3);
//! ```

mod bitfield;
mod frame;
mod link_state;
mod telemetry;

pub use bitfield::{StatusFlags, sequence_after, sequence_gap};
pub use frame::{MotionFrame, SourceId};
pub use link_state::{ConnectionState, LinkId, LinkStatus};
pub use telemetry::Telemetry;
