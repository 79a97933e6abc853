//! Soft joint limits for the follower arm.

use crate::error::TeleopError;
use crate::types::{JointVector, NUM_JOINTS};
use serde::{Deserialize, Serialize};

/// Clamp deviation (radians) above which a limit hit is reported.
pub const DEFAULT_LIMIT_TOLERANCE: f64 = 0.01;

/// Report at most one limit hit every this many ticks.
pub const DEFAULT_WARN_EVERY: u64 = 20;

/// Allowed interval for one joint, in radians.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JointLimit {
    /// Lower bound.
    pub lower: f64,
    /// Upper bound.
    pub upper: f64,
}

impl JointLimit {
    /// Create a limit interval.
    pub const fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    /// Clamp a value into the interval.
    pub fn clamp(&self, value: f64) -> f64 {
        self.upper.min(self.lower.max(value))
    }
}

/// ARX-X5 soft limits with a safety margin inside the mechanical stops.
pub const ARX_X5_LIMITS: [JointLimit; NUM_JOINTS] = [
    JointLimit::new(-2.53, 3.05), // -145° .. 175°
    JointLimit::new(-0.10, 3.60), // -5.7° .. 206.3°
    JointLimit::new(-0.09, 2.97), // -5° .. 170°
    JointLimit::new(-2.97, 2.97), // ±170°, wide enough for a 1:2 wrist mapping
    JointLimit::new(-1.29, 1.29), // ±74°
    JointLimit::new(-1.66, 1.66), // ±95°
];

/// Stateless per-joint clamp against a soft-limit table.
#[derive(Clone, Debug)]
pub struct JointLimiter {
    limits: [JointLimit; NUM_JOINTS],
    tolerance: f64,
    warn_every: u64,
}

impl JointLimiter {
    /// Build a limiter, validating every interval.
    pub fn new(limits: [JointLimit; NUM_JOINTS]) -> Result<Self, TeleopError> {
        for (i, limit) in limits.iter().enumerate() {
            if !limit.lower.is_finite() || !limit.upper.is_finite() {
                return Err(TeleopError::config(format!(
                    "joint {} limit is not finite",
                    i
                )));
            }
            if limit.lower > limit.upper {
                return Err(TeleopError::config(format!(
                    "joint {} limit lower {} exceeds upper {}",
                    i, limit.lower, limit.upper
                )));
            }
        }
        Ok(Self {
            limits,
            tolerance: DEFAULT_LIMIT_TOLERANCE,
            warn_every: DEFAULT_WARN_EVERY,
        })
    }

    /// Change how limit hits are reported.
    pub fn with_reporting(mut self, tolerance: f64, warn_every: u64) -> Self {
        self.tolerance = tolerance;
        self.warn_every = warn_every.max(1);
        self
    }

    /// Clamp one joint.
    pub fn clamp(&self, joint: usize, value: f64) -> f64 {
        self.limits[joint].clamp(value)
    }

    /// Clamp every joint, reporting large corrections on every `warn_every`-th tick.
    pub fn clamp_all(&self, targets: &JointVector, tick: u64) -> JointVector {
        let mut out = *targets;
        for (i, value) in out.iter_mut().enumerate() {
            let clamped = self.clamp(i, *value);
            if (clamped - *value).abs() > self.tolerance && tick % self.warn_every == 0 {
                tracing::warn!(
                    "Joint {} limited: {:.1}° -> {:.1}°",
                    i,
                    value.to_degrees(),
                    clamped.to_degrees()
                );
            }
            *value = clamped;
        }
        out
    }

    /// The configured intervals.
    pub fn limits(&self) -> &[JointLimit; NUM_JOINTS] {
        &self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joint1_target_clamps_to_upper() {
        let limiter = JointLimiter::new(ARX_X5_LIMITS).unwrap();
        assert_eq!(limiter.clamp(1, 4.0), 3.60);
        assert_eq!(limiter.clamp(1, -1.0), -0.10);
        assert_eq!(limiter.clamp(1, 1.0), 1.0);
    }

    #[test]
    fn test_never_leaves_interval() {
        let limiter = JointLimiter::new(ARX_X5_LIMITS).unwrap();
        let mut v = -10.0;
        while v <= 10.0 {
            let out = limiter.clamp_all(&[v; NUM_JOINTS], 0);
            for (i, o) in out.iter().enumerate() {
                let l = limiter.limits()[i];
                assert!(*o >= l.lower && *o <= l.upper, "joint {} -> {}", i, o);
            }
            v += 0.137;
        }
    }

    #[test]
    fn test_rejects_inverted_interval() {
        let mut limits = ARX_X5_LIMITS;
        limits[2] = JointLimit::new(1.0, -1.0);
        assert!(JointLimiter::new(limits).is_err());
        limits[2] = JointLimit::new(f64::NEG_INFINITY, 1.0);
        assert!(JointLimiter::new(limits).is_err());
    }
}
