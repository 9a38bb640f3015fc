//! Robot-reported state

use super::StatusFlags;

/// State reported back by the robot controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    /// Last frame sequence the robot applied
    pub sequence_echoed: u32,

    /// Measured joint values
    pub actual_axis_values: Vec<f64>,

    /// Controller status bits
    pub status_flags: StatusFlags,
}

impl Telemetry {
    /// Create a new telemetry record
    pub fn new(sequence_echoed: u32, actual_axis_values: Vec<f64>, status_flags: StatusFlags) -> Self {
        Self { sequence_echoed, actual_axis_values, status_flags }
    }

    /// Largest absolute difference between commanded and actual axis values.
    ///
    /// Returns `None` when the arities differ.
    pub fn drift_from(&self, commanded: &[f64]) -> Option<f64> {
        if commanded.len() != self.actual_axis_values.len() {
            return None;
        }
        Some(
            commanded
                .iter()
                .zip(&self.actual_axis_values)
                .map(|(c, a)| (c - a).abs())
                .fold(0.0, f64::max),
        )
    }
}
