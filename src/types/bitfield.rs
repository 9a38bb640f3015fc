//! Status bitfield reported by the robot controller

use serde::{Deserialize, Serialize};

/// Status bits carried in every telemetry packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusFlags(pub u32);

impl StatusFlags {
    /// Controller reports a fault.
    pub const FAULT: u32 = 0x0001;
    /// Emergency stop engaged.
    pub const ESTOP: u32 = 0x0002;
    /// Axes are in motion.
    pub const MOVING: u32 = 0x0004;
    /// Drives are powered.
    pub const MOTORS_ON: u32 = 0x0008;
    /// Controller accepts external position corrections.
    pub const REMOTE_MODE: u32 = 0x0010;

    /// No bits set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Create flags from a raw u32 value.
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Check if a specific bit is set.
    pub fn is_set(&self, bit: u32) -> bool {
        bit < 32 && (self.0 & (1 << bit)) != 0
    }

    /// Check if a specific flag is set using a bitmask.
    pub fn has_flag(&self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }

    /// Get the raw u32 value.
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Fault or e-stop present; the robot will not follow commands.
    pub fn is_halted(&self) -> bool {
        self.has_flag(Self::FAULT | Self::ESTOP)
    }
}

/// Compare sequence counters in u32 space with wraparound using half-range rule.
/// Returns true if `a` is considered newer than `b`.
pub fn sequence_after(a: u32, b: u32) -> bool {
    if a == b {
        return false;
    }
    a.wrapping_sub(b) < 0x8000_0000
}

/// Number of sequences strictly between `older` and `newer`.
///
/// Returns 0 when `newer` does not come after `older`.
pub fn sequence_gap(older: u32, newer: u32) -> u32 {
    if sequence_after(newer, older) { newer.wrapping_sub(older) - 1 } else { 0 }
}
