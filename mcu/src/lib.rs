//! Wire protocol for the stage motion microcontroller.
//!
//! The MCU accepts fixed-length 9-byte command frames and streams
//! fixed-length 10-byte telemetry records, batched 50 records per
//! 500-byte update message delivered every 250 ms.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod command;
pub mod telemetry;

pub use command::{CommandFrame, MotionFlags, Opcode};
pub use telemetry::{TelemetryBuffer, TelemetryRecord};

/// Fixed command frame size in bytes.
pub const CMD_LENGTH: usize = 9;
/// Bytes per encoded axis position field.
pub const N_BYTES_POS: usize = 3;
/// Fixed telemetry record size in bytes.
pub const RECORD_LENGTH: usize = 10;
/// Records batched into one update message.
pub const TIMEPOINT_PER_UPDATE: usize = 50;
/// Update message size in bytes.
pub const MSG_LENGTH: usize = RECORD_LENGTH * TIMEPOINT_PER_UPDATE;
/// MCU internal timer period; one telemetry record per tick.
pub const TIMER_PERIOD_MS: u64 = 5;
/// Interval between update messages.
pub const DATA_INTERVAL_MS: u64 = TIMER_PERIOD_MS * TIMEPOINT_PER_UPDATE as u64;

/// Largest step count that fits a signed 24-bit position field.
pub const STEPS_MAX: i32 = (1 << 23) - 1;
/// Smallest step count that fits a signed 24-bit position field.
pub const STEPS_MIN: i32 = -(1 << 23);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid axis identifier {0:#04x}")]
    InvalidAxis(u8),

    #[error("invalid opcode {0:#04x}")]
    InvalidOpcode(u8),

    #[error("frame length {got} does not match the expected {expected} bytes")]
    FrameLength { expected: usize, got: usize },

    #[error("checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    Checksum { computed: u8, received: u8 },

    #[error("step count {0} does not fit the 24-bit position range")]
    StepsOutOfRange(i32),

    #[error("record header {0:#04x} lacks the sync marker")]
    Marker(u8),
}

/// Stage axis. The wire identifiers are 0 (X), 1 (Y) and 2 (Z);
/// anything else is rejected on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn id(self) -> u8 {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

impl TryFrom<u8> for Axis {
    type Error = ProtocolError;

    fn try_from(id: u8) -> Result<Self, ProtocolError> {
        match id {
            0 => Ok(Axis::X),
            1 => Ok(Axis::Y),
            2 => Ok(Axis::Z),
            other => Err(ProtocolError::InvalidAxis(other)),
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Y => write!(f, "Y"),
            Axis::Z => write!(f, "Z"),
        }
    }
}

/// Three-axis stage position in microcontroller step units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AxisPosition {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl AxisPosition {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn get(&self, axis: Axis) -> i32 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    pub fn set(&mut self, axis: Axis, steps: i32) {
        match axis {
            Axis::X => self.x = steps,
            Axis::Y => self.y = steps,
            Axis::Z => self.z = steps,
        }
    }
}
