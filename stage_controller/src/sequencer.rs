//! Acquisition sequencer: walks a serpentine grid of fields, runs
//! autofocus on a fixed cadence and emits one capture per field.
//!
//! The scan is lazy and restartable. `next_field` performs exactly one
//! field and advances a persistent cursor, so a paused run resumes at
//! the next incomplete field without repeating motion.

use std::io::{Read, Write};
use std::sync::Arc;

use mcu::{Axis, AxisPosition};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{info, instrument, warn};

use crate::autofocus::{AfOutcome, AutofocusEngine};
use crate::camera::{Camera, Frame};
use crate::error::ControllerError;
use crate::link::LinkSnapshot;
use crate::motion::{MotionController, MotionProfile};
use crate::trigger::TriggerCoordinator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MicroscopeMode {
    #[default]
    Bfdf,
    Fluorescence,
    FluorescencePreview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Bmp,
    Tiff,
    Png,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AcquisitionParams {
    pub crop_width: u32,
    pub crop_height: u32,
    pub image_format: ImageFormat,
    pub display_scaling_factor: f64,
    /// Grid pitch, millimeters.
    pub dx_mm: f64,
    pub dy_mm: f64,
    pub cols: u32,
    pub rows: u32,
}

impl Default for AcquisitionParams {
    fn default() -> Self {
        Self {
            crop_width: 2200,
            crop_height: 2200,
            image_format: ImageFormat::Bmp,
            display_scaling_factor: 0.25,
            dx_mm: 1.0,
            dy_mm: 1.0,
            cols: 10,
            rows: 10,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldMetadata {
    pub mode: MicroscopeMode,
    pub format: ImageFormat,
    pub display_scaling_factor: f64,
    /// Outcome of the autofocus run this field used, if any ran yet.
    pub autofocus: Option<AfOutcome>,
    /// True when the field was abandoned after a retried motion
    /// timeout; `frame` is then absent.
    pub failed: bool,
}

#[derive(Debug, Clone)]
pub struct FieldCapture {
    pub index: usize,
    pub position: AxisPosition,
    pub frame: Option<Frame>,
    pub metadata: FieldMetadata,
}

pub struct AcquisitionSequencer<C: Read + Write + Send + 'static> {
    motion: MotionController<C>,
    trigger: TriggerCoordinator,
    autofocus: AutofocusEngine,
    camera: Arc<dyn Camera>,
    position_rx: watch::Receiver<LinkSnapshot>,
    params: AcquisitionParams,
    mode: MicroscopeMode,
    profile: MotionProfile,
    next_field: usize,
    session_started: bool,
    last_af: Option<AfOutcome>,
    z_center_mm: f64,
}

impl<C: Read + Write + Send + 'static> AcquisitionSequencer<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        motion: MotionController<C>,
        trigger: TriggerCoordinator,
        autofocus: AutofocusEngine,
        camera: Arc<dyn Camera>,
        position_rx: watch::Receiver<LinkSnapshot>,
        params: AcquisitionParams,
        mode: MicroscopeMode,
        profile: MotionProfile,
        z_center_mm: f64,
    ) -> Self {
        Self {
            motion,
            trigger,
            autofocus,
            camera,
            position_rx,
            params,
            mode,
            profile,
            next_field: 0,
            session_started: false,
            last_af: None,
            z_center_mm,
        }
    }

    pub fn total_fields(&self) -> usize {
        (self.params.cols * self.params.rows) as usize
    }

    /// Index of the next field to acquire.
    pub fn position_index(&self) -> usize {
        self.next_field
    }

    /// Repositions the cursor, e.g. to resume a previously interrupted
    /// scan.
    pub fn resume(&mut self, index: usize) {
        self.next_field = index.min(self.total_fields());
    }

    /// Stage target for a field index. Rows are walked boustrophedon:
    /// even rows left-to-right, odd rows right-to-left, so consecutive
    /// fields are always one pitch apart.
    pub fn field_position(&self, index: usize) -> (f64, f64) {
        let cols = self.params.cols as usize;
        let row = index / cols;
        let col_in_row = index % cols;
        let col = if row % 2 == 0 {
            col_in_row
        } else {
            cols - 1 - col_in_row
        };
        (col as f64 * self.params.dx_mm, row as f64 * self.params.dy_mm)
    }

    /// Acquires the next field, or returns `None` when the grid is
    /// exhausted. A retried motion timeout yields a capture marked
    /// failed; fatal errors (fault, link loss) propagate.
    #[instrument(skip(self), fields(index = self.next_field))]
    pub async fn next_field(&mut self) -> Result<Option<FieldCapture>, ControllerError> {
        let index = self.next_field;
        if index >= self.total_fields() {
            return Ok(None);
        }

        if !self.session_started {
            self.trigger.begin_session().await?;
            self.session_started = true;
        }

        let capture = match self.acquire(index).await {
            Ok(capture) => capture,
            Err(ControllerError::MotionTimeout { axis, timeout }) => {
                warn!(%axis, ?timeout, "field motion timed out, retrying once");
                match self.acquire(index).await {
                    Ok(capture) => capture,
                    Err(ControllerError::MotionTimeout { .. }) => {
                        warn!(index, "field abandoned after retry");
                        FieldCapture {
                            index,
                            position: self.position_rx.borrow().position,
                            frame: None,
                            metadata: self.metadata(true),
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        self.next_field = index + 1;
        Ok(Some(capture))
    }

    async fn acquire(&mut self, index: usize) -> Result<FieldCapture, ControllerError> {
        let (x_mm, y_mm) = self.field_position(index);

        self.motion.move_to(Axis::X, x_mm, self.profile).await?;
        let outcome = self.motion.move_to(Axis::Y, y_mm, self.profile).await?;

        if self.af_due(index) {
            let af = self
                .autofocus
                .run(&mut self.motion, self.camera.as_ref(), self.z_center_mm)
                .await?;
            self.z_center_mm = af.z_mm;
            self.last_af = Some(af);
        }

        self.trigger.prepare_field(outcome.settle);
        let field = self.trigger.collect(&self.position_rx).await?;
        let frame = field
            .frame
            .crop_centered(self.params.crop_width, self.params.crop_height);

        Ok(FieldCapture {
            index,
            position: field.position,
            frame: Some(frame),
            metadata: self.metadata(false),
        })
    }

    fn af_due(&self, index: usize) -> bool {
        let cadence = self.autofocus.params().fovs_per_af.max(1) as usize;
        self.last_af.is_none() || index % cadence == 0
    }

    fn metadata(&self, failed: bool) -> FieldMetadata {
        FieldMetadata {
            mode: self.mode,
            format: self.params.image_format,
            display_scaling_factor: self.params.display_scaling_factor,
            autofocus: self.last_af,
            failed,
        }
    }

    /// Runs the scan from the current cursor, streaming captures to
    /// `tx`. Returns when the grid is exhausted or the receiver is
    /// dropped; a dropped receiver pauses the scan, it does not lose
    /// the cursor.
    pub async fn run(&mut self, tx: mpsc::Sender<FieldCapture>) -> Result<(), ControllerError> {
        while let Some(capture) = self.next_field().await? {
            let index = capture.index;
            if tx.send(capture).await.is_err() {
                info!(index, "capture consumer gone, pausing scan");
                return Ok(());
            }
        }
        info!(fields = self.total_fields(), "scan complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autofocus::{AfParams, SharpnessScorer};
    use crate::camera::SimulatedCamera;
    use crate::link::testing::{fast_tuning, McuSimulator};
    use crate::link::McuLink;
    use crate::motion::{MotionLimits, WaitTimeModel};
    use crate::trigger::TriggerMode;
    use crate::units::StageGeometry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FlatScorer {
        calls: AtomicUsize,
    }

    impl FlatScorer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl SharpnessScorer for FlatScorer {
        fn score(&self, _frame: &Frame) -> f64 {
            self.calls.fetch_add(1, Ordering::Relaxed);
            1.0
        }
    }

    fn fast_wait() -> WaitTimeModel {
        WaitTimeModel {
            base_s: 0.0,
            x_s_per_mm: 0.0,
            y_s_per_mm: 0.0,
            z_s_per_mm: 0.0,
        }
    }

    fn small_grid() -> AcquisitionParams {
        AcquisitionParams {
            crop_width: 8,
            crop_height: 8,
            dx_mm: 1.0,
            dy_mm: 1.0,
            cols: 2,
            rows: 3,
            ..AcquisitionParams::default()
        }
    }

    async fn sequencer(
        sim: &McuSimulator,
        scorer: Arc<FlatScorer>,
        motion_timeout: Duration,
    ) -> AcquisitionSequencer<McuSimulator> {
        let (link, _io) = McuLink::connect(sim.clone(), fast_tuning());
        link.wait_synced(Duration::from_secs(1)).await.unwrap();
        let position_rx = link.subscribe();

        let motion = MotionController::new(
            link,
            StageGeometry::default(),
            MotionLimits::default(),
            fast_wait(),
            motion_timeout,
        );

        let camera: Arc<dyn Camera> = Arc::new(SimulatedCamera::new(16, 16));
        let trigger =
            TriggerCoordinator::new(TriggerMode::Software, Arc::clone(&camera), Duration::from_secs(1));

        let af_params = AfParams {
            fovs_per_af: 3,
            z_steps: 2,
            dz_mm: 0.01,
            crop_width: 4,
            crop_height: 4,
            ..AfParams::default()
        };
        let autofocus = AutofocusEngine::new(af_params, MotionProfile::default(), scorer);

        AcquisitionSequencer::new(
            motion,
            trigger,
            autofocus,
            camera,
            position_rx,
            small_grid(),
            MicroscopeMode::Bfdf,
            MotionProfile::default(),
            1.0,
        )
    }

    #[tokio::test]
    async fn serpentine_orders_fields_one_pitch_apart() {
        let sim = McuSimulator::new();
        let seq = sequencer(&sim, FlatScorer::new(), Duration::from_secs(2)).await;

        // 2-wide grid: row 0 runs left-to-right, row 1 right-to-left.
        assert_eq!(seq.field_position(0), (0.0, 0.0));
        assert_eq!(seq.field_position(1), (1.0, 0.0));
        assert_eq!(seq.field_position(2), (1.0, 1.0));
        assert_eq!(seq.field_position(3), (0.0, 1.0));
        assert_eq!(seq.field_position(4), (0.0, 2.0));
        assert_eq!(seq.field_position(5), (1.0, 2.0));
    }

    #[tokio::test]
    async fn scan_covers_the_grid_and_refocuses_on_cadence() {
        let sim = McuSimulator::new();
        let scorer = FlatScorer::new();
        let mut seq = sequencer(&sim, scorer.clone(), Duration::from_secs(2)).await;

        let (tx, mut rx) = mpsc::channel(16);
        seq.run(tx).await.unwrap();

        let mut captures = Vec::new();
        while let Ok(capture) = rx.try_recv() {
            captures.push(capture);
        }

        assert_eq!(captures.len(), 6);
        for (expected, capture) in captures.iter().enumerate() {
            assert_eq!(capture.index, expected);
            assert!(!capture.metadata.failed);
            let frame = capture.frame.as_ref().unwrap();
            assert_eq!((frame.width, frame.height), (8, 8));
            assert!(!capture.metadata.autofocus.unwrap().converged);
        }

        // Fields 0 and 3 refocus (cadence 3); 2 samples per scan.
        assert_eq!(scorer.calls.load(Ordering::Relaxed), 4);
        assert!(seq.next_field().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn capture_positions_follow_the_serpentine_path() {
        let sim = McuSimulator::new();
        let mut seq = sequencer(&sim, FlatScorer::new(), Duration::from_secs(2)).await;
        let geometry = StageGeometry::default();

        for index in 0..seq.total_fields() {
            let capture = seq.next_field().await.unwrap().unwrap();
            let (x_mm, y_mm) = seq.field_position(index);
            assert_eq!(capture.position.x, geometry.to_steps(Axis::X, x_mm));
            assert_eq!(capture.position.y, geometry.to_steps(Axis::Y, y_mm));
        }
    }

    #[tokio::test]
    async fn stalled_field_is_marked_failed_and_the_scan_continues() {
        let sim = McuSimulator::new();
        let mut seq = sequencer(&sim, FlatScorer::new(), Duration::from_millis(80)).await;

        let first = seq.next_field().await.unwrap().unwrap();
        assert!(!first.metadata.failed);

        sim.set_stall(true);
        let second = seq.next_field().await.unwrap().unwrap();
        assert!(second.metadata.failed);
        assert!(second.frame.is_none());
        assert_eq!(second.index, 1);

        sim.set_stall(false);
        let third = seq.next_field().await.unwrap().unwrap();
        assert!(!third.metadata.failed);
        assert_eq!(third.index, 2);
    }

    #[tokio::test]
    async fn resume_continues_from_the_requested_field() {
        let sim = McuSimulator::new();
        let mut seq = sequencer(&sim, FlatScorer::new(), Duration::from_secs(2)).await;

        seq.next_field().await.unwrap().unwrap();
        seq.next_field().await.unwrap().unwrap();
        assert_eq!(seq.position_index(), 2);

        seq.resume(5);
        let capture = seq.next_field().await.unwrap().unwrap();
        assert_eq!(capture.index, 5);
        assert!(seq.next_field().await.unwrap().is_none());
    }
}
