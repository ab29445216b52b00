//! Trigger coordinator: one exposure strategy per acquisition session,
//! chosen up front and dispatched exhaustively.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use mcu::AxisPosition;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::camera::{Camera, Frame};
use crate::error::ControllerError;
use crate::link::LinkSnapshot;

/// How exposures are initiated. Fixed for a whole session; switching
/// modes means starting a new coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Explicit capture request after the stage has settled.
    #[default]
    Software,
    /// The MCU fires the trigger line after a precomputed delay; the
    /// camera is armed before the pulse.
    Hardware,
    /// Free-running stream; frames are taken as they come and tagged
    /// with the stage position current at receipt.
    Continuous,
}

/// A frame together with the stage position it was captured at.
#[derive(Debug, Clone)]
pub struct FieldFrame {
    pub frame: Frame,
    pub position: AxisPosition,
}

pub struct TriggerCoordinator {
    mode: TriggerMode,
    camera: Arc<dyn Camera>,
    frame_timeout: Duration,
    stream: Option<mpsc::Receiver<Frame>>,
    armed: Option<JoinHandle<anyhow::Result<Frame>>>,
}

impl TriggerCoordinator {
    pub fn new(mode: TriggerMode, camera: Arc<dyn Camera>, frame_timeout: Duration) -> Self {
        Self {
            mode,
            camera,
            frame_timeout,
            stream: None,
            armed: None,
        }
    }

    pub fn mode(&self) -> TriggerMode {
        self.mode
    }

    /// Session setup. Only Continuous mode has any: it starts the
    /// free-running stream.
    #[instrument(skip(self), fields(mode = ?self.mode))]
    pub async fn begin_session(&mut self) -> Result<(), ControllerError> {
        match self.mode {
            TriggerMode::Continuous => {
                let stream = self
                    .camera
                    .start_continuous_stream()
                    .await
                    .map_err(ControllerError::Camera)?;
                self.stream = Some(stream);
                Ok(())
            }
            TriggerMode::Software | TriggerMode::Hardware => Ok(()),
        }
    }

    /// Per-field setup. In Hardware mode the camera is armed now, with
    /// the settle wait as the pulse delay, so the exposure fires as
    /// soon as the stage has come to rest.
    pub fn prepare_field(&mut self, settle: Duration) {
        match self.mode {
            TriggerMode::Hardware => {
                if let Some(stale) = self.armed.take() {
                    stale.abort();
                }
                let camera = Arc::clone(&self.camera);
                debug!(?settle, "arming hardware trigger");
                self.armed =
                    Some(tokio::spawn(
                        async move { camera.arm_hardware_trigger(settle).await },
                    ));
            }
            TriggerMode::Software | TriggerMode::Continuous => {}
        }
    }

    /// Obtains the field's frame according to the session mode, bounded
    /// by the frame timeout.
    #[instrument(skip_all, fields(mode = ?self.mode))]
    pub async fn collect(
        &mut self,
        position_rx: &watch::Receiver<LinkSnapshot>,
    ) -> Result<FieldFrame, ControllerError> {
        let timeout = self.frame_timeout;

        let frame = match self.mode {
            TriggerMode::Software => {
                let capture = self.camera.capture_frame();
                tokio::time::timeout(timeout, capture)
                    .await
                    .map_err(|_| ControllerError::FrameTimeout { timeout })?
                    .map_err(ControllerError::Camera)?
            }
            TriggerMode::Hardware => {
                let armed = self.armed.take().ok_or_else(|| {
                    ControllerError::Camera(anyhow!("collect called with no armed exposure"))
                })?;
                let frame = tokio::time::timeout(timeout, armed)
                    .await
                    .map_err(|_| ControllerError::FrameTimeout { timeout })?
                    .map_err(|join| ControllerError::Camera(anyhow!(join)))?;
                frame.map_err(ControllerError::Camera)?
            }
            TriggerMode::Continuous => {
                let stream = self.stream.as_mut().ok_or_else(|| {
                    ControllerError::Camera(anyhow!("collect called before begin_session"))
                })?;
                tokio::time::timeout(timeout, stream.recv())
                    .await
                    .map_err(|_| ControllerError::FrameTimeout { timeout })?
                    .ok_or(ControllerError::FrameTimeout { timeout })?
            }
        };

        // Tag with the position current at frame receipt, not the one
        // the move was commanded to.
        let position = position_rx.borrow().position;
        Ok(FieldFrame { frame, position })
    }
}
