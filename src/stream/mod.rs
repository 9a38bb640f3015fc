//! Stream utilities for frame pacing

pub mod governor;

pub use governor::{Emission, FrameSlot, GovernorStats, Pacer, RateGovernor};
