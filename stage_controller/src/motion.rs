//! Motion controller: validates requested moves, drives them through
//! the MCU link and tracks an explicit state machine so a fault is
//! never silently absorbed.

use std::io::{Read, Write};
use std::time::Duration;

use mcu::{Axis, CommandFrame};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::ControllerError;
use crate::link::{LinkStatus, McuLink};
use crate::units::StageGeometry;

/// Hard ceilings a requested profile must stay under. Violations are
/// rejected before any frame reaches the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MotionLimits {
    /// mm/s
    pub velocity_max: f64,
    /// mm/s^2
    pub acceleration_max: f64,
}

impl Default for MotionLimits {
    fn default() -> Self {
        Self {
            velocity_max: 100.0,
            acceleration_max: 500.0,
        }
    }
}

/// Requested kinematics for one move.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MotionProfile {
    /// mm/s
    pub velocity: f64,
    /// mm/s^2
    pub acceleration: f64,
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            velocity: 25.0,
            acceleration: 100.0,
        }
    }
}

impl MotionProfile {
    fn validate(&self, axis: Axis, limits: &MotionLimits) -> Result<(), ControllerError> {
        if self.velocity > limits.velocity_max {
            return Err(ControllerError::MotionLimitExceeded {
                axis,
                quantity: "velocity",
                requested: self.velocity,
                max: limits.velocity_max,
            });
        }
        if self.acceleration > limits.acceleration_max {
            return Err(ControllerError::MotionLimitExceeded {
                axis,
                quantity: "acceleration",
                requested: self.acceleration,
                max: limits.acceleration_max,
            });
        }
        Ok(())
    }
}

/// Linear settle-time model: `base + coeff(axis) * |distance|`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WaitTimeModel {
    pub base_s: f64,
    pub x_s_per_mm: f64,
    pub y_s_per_mm: f64,
    pub z_s_per_mm: f64,
}

impl Default for WaitTimeModel {
    fn default() -> Self {
        Self {
            base_s: 0.001,
            x_s_per_mm: 0.004,
            y_s_per_mm: 0.004,
            z_s_per_mm: 0.004,
        }
    }
}

impl WaitTimeModel {
    pub fn settle(&self, axis: Axis, distance_mm: f64) -> Duration {
        let coeff = match axis {
            Axis::X => self.x_s_per_mm,
            Axis::Y => self.y_s_per_mm,
            Axis::Z => self.z_s_per_mm,
        };
        Duration::from_secs_f64(self.base_s + coeff * distance_mm.abs())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    Idle,
    Commanded,
    InMotion,
    Settling,
    Faulted,
}

/// What a completed move actually did.
#[derive(Debug, Clone, Copy)]
pub struct MoveOutcome {
    pub distance_mm: f64,
    pub settle: Duration,
}

pub struct MotionController<C: Read + Write + Send + 'static> {
    link: McuLink<C>,
    geometry: StageGeometry,
    limits: MotionLimits,
    wait_model: WaitTimeModel,
    motion_timeout: Duration,
    state: MotionState,
}

impl<C: Read + Write + Send + 'static> MotionController<C> {
    pub fn new(
        link: McuLink<C>,
        geometry: StageGeometry,
        limits: MotionLimits,
        wait_model: WaitTimeModel,
        motion_timeout: Duration,
    ) -> Self {
        Self {
            link,
            geometry,
            limits,
            wait_model,
            motion_timeout,
            state: MotionState::Idle,
        }
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn geometry(&self) -> StageGeometry {
        self.geometry
    }

    /// Current axis position in millimeters, from the latest telemetry.
    pub fn position_mm(&self, axis: Axis) -> f64 {
        self.geometry
            .to_mm(axis, self.link.latest().position.get(axis))
    }

    /// Settle wait the controller would apply after traveling
    /// `distance_mm` on `axis`. Pure; used to pre-arm hardware triggers.
    pub fn settle_estimate(&self, axis: Axis, distance_mm: f64) -> Duration {
        self.wait_model.settle(axis, distance_mm)
    }

    /// Moves one axis to an absolute millimeter target and waits for
    /// completion plus the settle time. `&mut self` keeps at most one
    /// command in flight per controller.
    #[instrument(skip(self), fields(state = ?self.state))]
    pub async fn move_to(
        &mut self,
        axis: Axis,
        target_mm: f64,
        profile: MotionProfile,
    ) -> Result<MoveOutcome, ControllerError> {
        if self.state == MotionState::Faulted {
            return Err(ControllerError::Faulted);
        }
        profile.validate(axis, &self.limits)?;

        let snapshot = self.link.latest();
        if snapshot.status != LinkStatus::Synced {
            return Err(ControllerError::LinkDisconnected);
        }

        let target_steps = self.geometry.to_steps(axis, target_mm);
        let start_mm = self.geometry.to_mm(axis, snapshot.position.get(axis));
        let distance_mm = (target_mm - start_mm).abs();
        let frame = CommandFrame::move_to(axis, target_steps)?;

        self.state = MotionState::Commanded;
        if let Err(e) = self.link.send_frame(frame).await {
            // The frame may have gone out partially; the stage state is
            // unknown until an operator intervenes.
            self.state = MotionState::Faulted;
            return Err(e);
        }

        // Completion only counts if it is reported by telemetry that
        // arrived after the command was acknowledged.
        let baseline = self.link.latest().records_seen;
        self.state = MotionState::InMotion;

        match self.await_completion(baseline).await {
            Ok(()) => {}
            Err(ControllerError::MotionTimeout { .. }) => {
                warn!(%axis, timeout = ?self.motion_timeout, "motion timed out, stopping axis");
                if let Err(e) = self.link.send_frame(CommandFrame::stop(axis)).await {
                    self.state = MotionState::Faulted;
                    return Err(e);
                }
                self.state = MotionState::Idle;
                return Err(ControllerError::MotionTimeout {
                    axis,
                    timeout: self.motion_timeout,
                });
            }
            Err(e) => {
                self.state = MotionState::Faulted;
                return Err(e);
            }
        }

        self.state = MotionState::Settling;
        let settle = self.wait_model.settle(axis, distance_mm);
        debug!(%axis, distance_mm, ?settle, "motion complete, settling");
        tokio::time::sleep(settle).await;

        self.state = MotionState::Idle;
        Ok(MoveOutcome {
            distance_mm,
            settle,
        })
    }

    async fn await_completion(&self, baseline: u64) -> Result<(), ControllerError> {
        let mut rx = self.link.subscribe();

        let wait = async {
            loop {
                {
                    let snapshot = rx.borrow_and_update();
                    if snapshot.status == LinkStatus::Disconnected {
                        return Err(ControllerError::LinkDisconnected);
                    }
                    if snapshot.records_seen > baseline && snapshot.motion_complete {
                        return Ok(());
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(ControllerError::LinkDisconnected);
                }
            }
        };

        match tokio::time::timeout(self.motion_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ControllerError::MotionTimeout {
                // Caller fills in the axis; this variant only signals
                // the timeout class internally.
                axis: Axis::X,
                timeout: self.motion_timeout,
            }),
        }
    }

    /// Homes one axis against its limit switch and waits for completion.
    #[instrument(skip(self))]
    pub async fn home(&mut self, axis: Axis, reverse: bool) -> Result<(), ControllerError> {
        if self.state == MotionState::Faulted {
            return Err(ControllerError::Faulted);
        }
        let snapshot = self.link.latest();
        if snapshot.status != LinkStatus::Synced {
            return Err(ControllerError::LinkDisconnected);
        }

        self.state = MotionState::Commanded;
        if let Err(e) = self.link.send_frame(CommandFrame::home(axis, reverse)).await {
            self.state = MotionState::Faulted;
            return Err(e);
        }

        let baseline = self.link.latest().records_seen;
        self.state = MotionState::InMotion;
        match self.await_completion(baseline).await {
            Ok(()) => {
                self.state = MotionState::Idle;
                Ok(())
            }
            Err(ControllerError::MotionTimeout { .. }) => {
                self.state = MotionState::Idle;
                Err(ControllerError::MotionTimeout {
                    axis,
                    timeout: self.motion_timeout,
                })
            }
            Err(e) => {
                self.state = MotionState::Faulted;
                Err(e)
            }
        }
    }

    /// Halts one axis immediately. Always lands in Idle (not a fault):
    /// cancellation is an ordinary outcome.
    #[instrument(skip(self))]
    pub async fn stop(&mut self, axis: Axis) -> Result<(), ControllerError> {
        if self.state == MotionState::Faulted {
            return Err(ControllerError::Faulted);
        }
        self.link.send_frame(CommandFrame::stop(axis)).await?;
        self.state = MotionState::Idle;
        Ok(())
    }

    /// Clears a fault after the operator has re-established a safe
    /// stage state.
    pub fn reset(&mut self) {
        if self.state == MotionState::Faulted {
            warn!("motion controller fault cleared by reset");
        }
        self.state = MotionState::Idle;
    }
}
