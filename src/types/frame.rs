//! Motion frame types for the animation → robot path

use std::fmt;
use std::time::SystemTime;

/// Identifies the upstream that produced a frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceId(pub String);

impl SourceId {
    /// Create a new source identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new("animation")
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One animator-tick snapshot of joint values.
///
/// This is the fundamental unit that flows from the animation link to the
/// robot link. Frames are per-tick values: once forwarded or superseded they
/// are dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionFrame {
    /// Monotonically increasing per source
    pub sequence: u32,

    /// Capture time on the producer side
    pub timestamp: SystemTime,

    /// Joint values, one per degree of freedom
    pub axis_values: Vec<f64>,

    /// Upstream that produced this frame
    pub source_id: SourceId,
}

impl MotionFrame {
    /// Create a new motion frame
    pub fn new(
        sequence: u32,
        timestamp: SystemTime,
        axis_values: Vec<f64>,
        source_id: SourceId,
    ) -> Self {
        Self { sequence, timestamp, axis_values, source_id }
    }

    /// Number of axes carried by this frame.
    pub fn arity(&self) -> usize {
        self.axis_values.len()
    }
}
