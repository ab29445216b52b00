//! Autofocus: a bounded Z scan that scores a centered crop of each
//! frame and stops early once the sharpness peak has been passed.
//!
//! The early exit assumes the sharpness curve is unimodal across the
//! scan span. When the ratio test never fires the engine finishes the
//! whole span and falls back to the best position seen; that outcome
//! is flagged, not treated as an error.

use std::io::{Read, Write};
use std::sync::Arc;

use mcu::Axis;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::camera::{Camera, Frame};
use crate::error::ControllerError;
use crate::motion::{MotionController, MotionProfile};

/// Scores a frame for sharpness. Higher is sharper; the engine only
/// compares scores, absolute scale does not matter.
pub trait SharpnessScorer: Send + Sync {
    fn score(&self, frame: &Frame) -> f64;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AfParams {
    /// Early-exit ratio: once `score / best` drops below this the peak
    /// has been passed.
    pub stop_threshold: f64,
    pub crop_width: u32,
    pub crop_height: u32,
    /// Fields between autofocus runs during a scan.
    pub fovs_per_af: u32,
    /// Z increment per scan step, millimeters.
    pub dz_mm: f64,
    /// Number of scan steps across the span.
    pub z_steps: u32,
}

impl Default for AfParams {
    fn default() -> Self {
        Self {
            stop_threshold: 0.85,
            crop_width: 500,
            crop_height: 500,
            fovs_per_af: 3,
            dz_mm: 0.003,
            z_steps: 10,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AfOutcome {
    pub z_mm: f64,
    pub score: f64,
    /// False when the scan ran out of span without passing a peak and
    /// fell back to the best position seen.
    pub converged: bool,
}

pub struct AutofocusEngine {
    params: AfParams,
    profile: MotionProfile,
    scorer: Arc<dyn SharpnessScorer>,
}

impl AutofocusEngine {
    pub fn new(params: AfParams, profile: MotionProfile, scorer: Arc<dyn SharpnessScorer>) -> Self {
        Self {
            params,
            profile,
            scorer,
        }
    }

    pub fn params(&self) -> &AfParams {
        &self.params
    }

    /// Scans Z around `z_center_mm` and leaves the stage at the
    /// sharpest position found.
    #[instrument(skip(self, motion, camera))]
    pub async fn run<C: Read + Write + Send + 'static>(
        &self,
        motion: &mut MotionController<C>,
        camera: &dyn Camera,
        z_center_mm: f64,
    ) -> Result<AfOutcome, ControllerError> {
        let span = self.params.dz_mm * (self.params.z_steps.saturating_sub(1)) as f64;
        let start_mm = z_center_mm - span / 2.0;

        let mut best_score = f64::NEG_INFINITY;
        let mut best_z_mm = z_center_mm;
        let mut converged = false;

        for step in 0..self.params.z_steps {
            let z_mm = start_mm + self.params.dz_mm * step as f64;
            motion.move_to(Axis::Z, z_mm, self.profile).await?;

            let frame = camera
                .capture_frame()
                .await
                .map_err(ControllerError::Camera)?;
            let crop = frame.crop_centered(self.params.crop_width, self.params.crop_height);
            let score = self.scorer.score(&crop);
            debug!(step, z_mm, score, "autofocus sample");

            if score > best_score {
                best_score = score;
                best_z_mm = z_mm;
            } else if best_score > 0.0 && score / best_score < self.params.stop_threshold {
                // The curve has fallen off the peak; no point scanning
                // the rest of the span.
                converged = true;
                break;
            }
        }

        motion.move_to(Axis::Z, best_z_mm, self.profile).await?;
        info!(z_mm = best_z_mm, score = best_score, converged, "autofocus done");

        Ok(AfOutcome {
            z_mm: best_z_mm,
            score: best_score,
            converged,
        })
    }
}
