use std::io;
use std::time::Duration;

use mcu::{Axis, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{axis} {quantity} {requested:.3} exceeds the configured maximum {max:.3}")]
    MotionLimitExceeded {
        axis: Axis,
        quantity: &'static str,
        requested: f64,
        max: f64,
    },

    #[error("failed to write command frame to the MCU link: {source}")]
    LinkWrite {
        #[source]
        source: io::Error,
    },

    #[error("MCU link is disconnected")]
    LinkDisconnected,

    #[error("{axis} motion did not complete within {timeout:?}")]
    MotionTimeout { axis: Axis, timeout: Duration },

    #[error("no frame was delivered within {timeout:?}")]
    FrameTimeout { timeout: Duration },

    #[error("motion controller is faulted and requires an explicit reset")]
    Faulted,

    #[error("camera operation failed: {0}")]
    Camera(#[source] anyhow::Error),
}
