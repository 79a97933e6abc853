//! Feetech leader calibration.
//!
//! Each servo records the smallest and largest position seen while the
//! operator sweeps the arm through its full range. Joints are then normalized
//! to `-100..100` over that range and the gripper to `0..100`, which is the
//! unit the mapper's angular scale expects.
//!
//! Produced by the `feetech-calibrate` binary and stored as JSON.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Smallest usable sweep (radians).
const MIN_RANGE: f64 = 1e-3;

/// Output range of a normalized servo.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormMode {
    /// `min..max` maps to `-100..100`.
    RangeM100To100,
    /// `min..max` maps to `0..100`.
    Range0To100,
}

/// Sweep limits of one servo, in the controller's position unit (radians).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotorCalibration {
    /// Servo bus id.
    pub id: u8,
    /// Lowest position seen during the sweep.
    pub min: f64,
    /// Highest position seen during the sweep.
    pub max: f64,
}

impl MotorCalibration {
    /// Midpoint of the sweep.
    pub fn center(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    /// Width of the sweep.
    pub fn range(&self) -> f64 {
        self.max - self.min
    }

    /// Normalize a raw position. Positions outside the sweep extrapolate.
    pub fn normalize(&self, position: f64, mode: NormMode) -> f64 {
        let unit = (position - self.min) / self.range();
        match mode {
            NormMode::RangeM100To100 => unit * 200.0 - 100.0,
            NormMode::Range0To100 => unit * 100.0,
        }
    }
}

/// Calibration of every servo on the leader bus.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaderCalibration {
    /// One entry per servo, in bus order.
    pub motors: Vec<MotorCalibration>,
}

impl LeaderCalibration {
    /// Load and validate a calibration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading calibration {}", path.display()))?;
        let calibration: Self = serde_json::from_str(&contents)
            .with_context(|| format!("bad calibration JSON in {}", path.display()))?;
        calibration.validate()?;
        Ok(calibration)
    }

    /// Write as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing calibration {}", path.display()))
    }

    /// Reject sweeps that are empty, inverted or not finite.
    pub fn validate(&self) -> Result<()> {
        for m in &self.motors {
            if !(m.min.is_finite() && m.max.is_finite()) || m.range() < MIN_RANGE {
                bail!(
                    "servo {} has an unusable range [{}, {}]; rerun calibration",
                    m.id,
                    m.min,
                    m.max
                );
            }
        }
        Ok(())
    }

    /// Calibration for servo `id`.
    pub fn get(&self, id: u8) -> Option<&MotorCalibration> {
        self.motors.iter().find(|m| m.id == id)
    }

    /// Calibrations for `ids`, in order; fails on the first missing one.
    pub fn for_ids(&self, ids: &[u8]) -> Result<Vec<MotorCalibration>> {
        ids.iter()
            .map(|&id| {
                self.get(id)
                    .copied()
                    .with_context(|| format!("no calibration for servo {}", id))
            })
            .collect()
    }
}

/// Running min/max per servo during a calibration sweep.
#[derive(Clone, Debug)]
pub struct RangeTracker {
    ids: Vec<u8>,
    mins: Vec<f64>,
    maxs: Vec<f64>,
}

impl RangeTracker {
    /// Track `ids`.
    pub fn new(ids: &[u8]) -> Self {
        Self {
            ids: ids.to_vec(),
            mins: vec![f64::INFINITY; ids.len()],
            maxs: vec![f64::NEG_INFINITY; ids.len()],
        }
    }

    /// Fold in one reading per servo, in `ids` order. Non-finite readings are skipped.
    pub fn observe(&mut self, positions: &[f64]) {
        for (i, &p) in positions.iter().enumerate().take(self.ids.len()) {
            if p.is_finite() {
                self.mins[i] = self.mins[i].min(p);
                self.maxs[i] = self.maxs[i].max(p);
            }
        }
    }

    /// One-line progress summary.
    pub fn summary(&self) -> String {
        self.ids
            .iter()
            .enumerate()
            .map(|(i, id)| format!("s{}:[{:>6.2} {:>6.2}]", id, self.mins[i], self.maxs[i]))
            .collect::<Vec<_>>()
            .join("  ")
    }

    /// Finish the sweep.
    pub fn finish(&self) -> Result<LeaderCalibration> {
        let calibration = LeaderCalibration {
            motors: self
                .ids
                .iter()
                .enumerate()
                .map(|(i, &id)| MotorCalibration {
                    id,
                    min: self.mins[i],
                    max: self.maxs[i],
                })
                .collect(),
        };
        calibration.validate()?;
        Ok(calibration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_normalize_ranges() {
        let m = MotorCalibration {
            id: 1,
            min: -1.0,
            max: 3.0,
        };
        assert_eq!(m.center(), 1.0);
        assert_relative_eq!(m.normalize(1.0, NormMode::RangeM100To100), 0.0);
        assert_relative_eq!(m.normalize(3.0, NormMode::RangeM100To100), 100.0);
        assert_relative_eq!(m.normalize(-1.0, NormMode::RangeM100To100), -100.0);
        assert_relative_eq!(m.normalize(0.0, NormMode::Range0To100), 25.0);
    }

    #[test]
    fn test_tracker_sweep_and_roundtrip() {
        let mut tracker = RangeTracker::new(&[1, 7]);
        tracker.observe(&[0.5, 0.0]);
        tracker.observe(&[-0.5, f64::NAN]);
        tracker.observe(&[0.2, 1.2]);
        let calibration = tracker.finish().unwrap();
        assert_eq!(calibration.get(1).unwrap().min, -0.5);
        assert_eq!(calibration.get(7).unwrap().max, 1.2);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leader.json");
        calibration.save(&path).unwrap();
        assert_eq!(LeaderCalibration::load(&path).unwrap(), calibration);
        assert!(calibration.for_ids(&[1, 2]).is_err());
    }

    #[test]
    fn test_unmoved_servo_is_rejected() {
        let mut tracker = RangeTracker::new(&[3]);
        tracker.observe(&[0.4]);
        assert!(tracker.finish().is_err());
        assert!(RangeTracker::new(&[4]).finish().is_err());
    }
}
