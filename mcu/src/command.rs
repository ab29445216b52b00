//! Fixed-length command frames sent to the MCU.
//!
//! Layout (9 bytes):
//!
//! ```text
//! byte 0      opcode          0x01 Move | 0x02 Home | 0x03 Stop
//! byte 1      axis id         0x00 X | 0x01 Y | 0x02 Z
//! bytes 2..6  target steps    i32, big-endian two's complement,
//!                             limited to the 24-bit step range
//! bytes 6..8  motion flags    u16, big-endian
//! byte 8      checksum        XOR of bytes 0..8
//! ```

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{Axis, ProtocolError, CMD_LENGTH, STEPS_MAX, STEPS_MIN};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct MotionFlags: u16 {
        /// Target is a displacement from the current position.
        const RELATIVE = 0b0000_0001;
        /// Home towards the negative limit switch.
        const REVERSE_HOME = 0b0000_0010;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Move = 0x01,
    Home = 0x02,
    Stop = 0x03,
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x01 => Ok(Opcode::Move),
            0x02 => Ok(Opcode::Home),
            0x03 => Ok(Opcode::Stop),
            other => Err(ProtocolError::InvalidOpcode(other)),
        }
    }
}

/// One command frame. Encoding is always exactly [`CMD_LENGTH`] bytes;
/// a buffer of any other length fails decoding with
/// [`ProtocolError::FrameLength`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    pub opcode: Opcode,
    pub axis: Axis,
    pub steps: i32,
    pub flags: MotionFlags,
}

impl CommandFrame {
    pub fn move_to(axis: Axis, steps: i32) -> Result<Self, ProtocolError> {
        Self {
            opcode: Opcode::Move,
            axis,
            steps,
            flags: MotionFlags::empty(),
        }
        .checked()
    }

    pub fn move_relative(axis: Axis, steps: i32) -> Result<Self, ProtocolError> {
        Self {
            opcode: Opcode::Move,
            axis,
            steps,
            flags: MotionFlags::RELATIVE,
        }
        .checked()
    }

    pub fn home(axis: Axis, reverse: bool) -> Self {
        let flags = if reverse {
            MotionFlags::REVERSE_HOME
        } else {
            MotionFlags::empty()
        };

        Self {
            opcode: Opcode::Home,
            axis,
            steps: 0,
            flags,
        }
    }

    pub fn stop(axis: Axis) -> Self {
        Self {
            opcode: Opcode::Stop,
            axis,
            steps: 0,
            flags: MotionFlags::empty(),
        }
    }

    fn checked(self) -> Result<Self, ProtocolError> {
        if self.steps < STEPS_MIN || self.steps > STEPS_MAX {
            return Err(ProtocolError::StepsOutOfRange(self.steps));
        }
        Ok(self)
    }

    pub fn encode(&self) -> [u8; CMD_LENGTH] {
        let mut buf = [0u8; CMD_LENGTH];
        buf[0] = self.opcode as u8;
        buf[1] = self.axis.id();
        buf[2..6].copy_from_slice(&self.steps.to_be_bytes());
        buf[6..8].copy_from_slice(&self.flags.bits().to_be_bytes());
        buf[8] = checksum(&buf[..8]);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != CMD_LENGTH {
            return Err(ProtocolError::FrameLength {
                expected: CMD_LENGTH,
                got: bytes.len(),
            });
        }

        let computed = checksum(&bytes[..8]);
        if computed != bytes[8] {
            return Err(ProtocolError::Checksum {
                computed,
                received: bytes[8],
            });
        }

        let opcode = Opcode::try_from(bytes[0])?;
        let axis = Axis::try_from(bytes[1])?;
        let steps = i32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let flags = MotionFlags::from_bits_retain(u16::from_be_bytes([bytes[6], bytes[7]]));

        Self {
            opcode,
            axis,
            steps,
            flags,
        }
        .checked()
    }
}

pub(crate) fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, byte| acc ^ byte)
}
