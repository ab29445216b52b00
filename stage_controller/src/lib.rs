//! Motion and acquisition control for an automated scanning
//! microscope: talks to the stage MCU over its binary protocol, drives
//! moves with settle handling, coordinates camera triggering and walks
//! acquisition grids with periodic autofocus.

pub mod autofocus;
pub mod camera;
pub mod config;
pub mod error;
pub mod link;
pub mod logging;
pub mod motion;
pub mod sequencer;
pub mod trigger;
pub mod units;

pub use autofocus::SharpnessScorer;
pub use error::ControllerError;
