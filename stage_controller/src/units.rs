//! Conversions between physical millimeters and microcontroller step
//! counts. Pure functions over an immutable per-axis calibration.

use mcu::Axis;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageGeometry {
    pub steps_per_mm_xy: f64,
    pub steps_per_mm_z: f64,
}

impl Default for StageGeometry {
    fn default() -> Self {
        Self {
            steps_per_mm_xy: 40.0,
            steps_per_mm_z: 5333.0,
        }
    }
}

impl StageGeometry {
    pub fn steps_per_mm(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X | Axis::Y => self.steps_per_mm_xy,
            Axis::Z => self.steps_per_mm_z,
        }
    }

    /// Nearest whole step to the given millimeter position.
    pub fn to_steps(&self, axis: Axis, mm: f64) -> i32 {
        (mm * self.steps_per_mm(axis)).round() as i32
    }

    pub fn to_mm(&self, axis: Axis, steps: i32) -> f64 {
        steps as f64 / self.steps_per_mm(axis)
    }

    /// Sub-step residual left over by rounding, in millimeters. Zero
    /// whenever the steps-per-mm calibration divides the target evenly.
    pub fn residual_mm(&self, axis: Axis, mm: f64) -> f64 {
        mm - self.to_mm(axis, self.to_steps(axis, mm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_to_mm_round_trip_is_exact() {
        let geometry = StageGeometry::default();

        for axis in Axis::ALL {
            for steps in [-40_000, -1, 0, 1, 5333, 123_456] {
                let mm = geometry.to_mm(axis, steps);
                assert_eq!(geometry.to_steps(axis, mm), steps);
            }
        }
    }

    #[test]
    fn mm_to_steps_rounds_within_one_step() {
        let geometry = StageGeometry {
            steps_per_mm_xy: 40.0,
            steps_per_mm_z: 5333.0,
        };

        for axis in Axis::ALL {
            for mm in [0.0123, -7.7, 1.0, 2.000_01] {
                let steps = geometry.to_steps(axis, mm);
                let back = geometry.to_mm(axis, steps);
                assert!((back - mm).abs() * geometry.steps_per_mm(axis) <= 0.5 + 1e-9);
            }
        }
    }

    #[test]
    fn residual_is_zero_for_even_divisions() {
        let geometry = StageGeometry {
            steps_per_mm_xy: 40.0,
            steps_per_mm_z: 5000.0,
        };

        // 40 steps/mm divides 0.025 mm evenly.
        assert_eq!(geometry.residual_mm(Axis::X, 0.025), 0.0);
        assert!(geometry.residual_mm(Axis::X, 0.0126).abs() > 0.0);
    }
}
