use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use utilities::lazy_tcp::LazyTcpStream;

use stage_controller::autofocus::AutofocusEngine;
use stage_controller::camera::{Camera, Frame, SimulatedCamera};
use stage_controller::config::{init_config_with_options, ConfigOptions};
use stage_controller::link::{LinkTuning, McuLink};
use stage_controller::logging;
use stage_controller::motion::MotionController;
use stage_controller::sequencer::AcquisitionSequencer;
use stage_controller::trigger::TriggerCoordinator;
use stage_controller::SharpnessScorer;

/// Mean absolute deviation from the frame mean. Stand-in scorer until
/// a real one is injected by the imaging pipeline.
struct ContrastScorer;

impl SharpnessScorer for ContrastScorer {
    fn score(&self, frame: &Frame) -> f64 {
        if frame.data.is_empty() {
            return 0.0;
        }
        let mean = frame.data.iter().map(|&p| p as f64).sum::<f64>() / frame.data.len() as f64;
        frame
            .data
            .iter()
            .map(|&p| (p as f64 - mean).abs())
            .sum::<f64>()
            / frame.data.len() as f64
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let (_config_manager, config) = init_config_with_options(ConfigOptions::default())
        .map_err(|e| {
            eprintln!("Failed to load configuration: {}", e);
            e
        })?;

    let channel = LazyTcpStream::new(
        config.link.address,
        3,
        Duration::from_millis(config.link.read_timeout_ms),
        Duration::from_millis(config.link.write_timeout_ms),
        Duration::from_millis(config.link.connect_timeout_ms),
    );

    let tuning = LinkTuning {
        max_read_failures: config.link.max_read_failures,
        ..LinkTuning::default()
    };
    let (link, _io_task) = McuLink::connect(channel, tuning);

    info!(addr = %config.link.address, "waiting for MCU telemetry");
    link.wait_synced(Duration::from_secs(10)).await?;

    let position_rx = link.subscribe();
    let motion = MotionController::new(
        link,
        config.geometry,
        config.limits,
        config.wait_time,
        config.timeouts.motion(),
    );

    let camera: Arc<dyn Camera> = Arc::new(SimulatedCamera::new(3000, 3000));
    let trigger = TriggerCoordinator::new(
        config.trigger_mode,
        Arc::clone(&camera),
        config.timeouts.frame(),
    );
    let autofocus = AutofocusEngine::new(config.autofocus, config.profile, Arc::new(ContrastScorer));

    let mut sequencer = AcquisitionSequencer::new(
        motion,
        trigger,
        autofocus,
        camera,
        position_rx,
        config.acquisition,
        config.microscope_mode,
        config.profile,
        config.z_center_mm,
    );

    info!(
        fields = sequencer.total_fields(),
        mode = ?config.microscope_mode,
        trigger = ?config.trigger_mode,
        "starting acquisition"
    );

    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let scan = tokio::spawn(async move {
        let result = sequencer.run(tx).await;
        (sequencer, result)
    });

    while let Some(capture) = rx.recv().await {
        if capture.metadata.failed {
            tracing::warn!(index = capture.index, "field failed");
        } else {
            info!(
                index = capture.index,
                x = capture.position.x,
                y = capture.position.y,
                z = capture.position.z,
                "field captured"
            );
        }
    }

    let (_sequencer, result) = scan.await?;
    result?;

    Ok(())
}
