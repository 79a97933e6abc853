//! First-order low-pass filtering of joint targets.

use crate::error::TeleopError;
use crate::types::{JointVector, NUM_JOINTS};
use std::f64::consts::PI;

/// Single-channel exponential smoothing filter.
///
/// The coefficient is fixed at construction:
/// `alpha = dt / (rc + dt)` with `rc = 1 / (2π·fc)` and `dt = 1 / fs`.
/// The first sample passes through unchanged so there is no start-up
/// transient.
#[derive(Clone, Debug)]
pub struct LowPassFilter {
    alpha: f64,
    y: Option<f64>,
}

impl LowPassFilter {
    /// Create a filter. `cutoff_hz` and `sample_rate_hz` must be positive.
    pub fn new(cutoff_hz: f64, sample_rate_hz: f64) -> Self {
        debug_assert!(cutoff_hz > 0.0 && sample_rate_hz > 0.0);
        let dt = 1.0 / sample_rate_hz;
        let rc = 1.0 / (2.0 * PI * cutoff_hz);
        Self {
            alpha: dt / (rc + dt),
            y: None,
        }
    }

    /// Create a filter, rejecting non-positive or non-finite parameters.
    pub fn try_new(cutoff_hz: f64, sample_rate_hz: f64) -> Result<Self, TeleopError> {
        if !(cutoff_hz.is_finite() && cutoff_hz > 0.0) {
            return Err(TeleopError::config(format!(
                "cutoff frequency must be positive, got {}",
                cutoff_hz
            )));
        }
        if !(sample_rate_hz.is_finite() && sample_rate_hz > 0.0) {
            return Err(TeleopError::config(format!(
                "sample rate must be positive, got {}",
                sample_rate_hz
            )));
        }
        Ok(Self::new(cutoff_hz, sample_rate_hz))
    }

    /// Feed one sample and return the filtered value.
    pub fn update(&mut self, x: f64) -> f64 {
        let y = match self.y {
            None => x,
            Some(prev) => self.alpha * x + (1.0 - self.alpha) * prev,
        };
        self.y = Some(y);
        y
    }

    /// Forget the internal state; the next sample passes through unchanged.
    pub fn reset(&mut self) {
        self.y = None;
    }

    /// Whether at least one sample has been seen since construction or reset.
    pub fn is_initialized(&self) -> bool {
        self.y.is_some()
    }

    /// Smoothing coefficient.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

/// One [`LowPassFilter`] per joint.
#[derive(Clone, Debug)]
pub struct FilterBank {
    filters: [LowPassFilter; NUM_JOINTS],
}

impl FilterBank {
    /// Build a bank from per-joint cutoffs sharing one sample rate.
    pub fn new(cutoffs_hz: &JointVector, sample_rate_hz: f64) -> Result<Self, TeleopError> {
        let mut filters = Vec::with_capacity(NUM_JOINTS);
        for &fc in cutoffs_hz {
            filters.push(LowPassFilter::try_new(fc, sample_rate_hz)?);
        }
        let filters: [LowPassFilter; NUM_JOINTS] = filters
            .try_into()
            .map_err(|_| TeleopError::config("filter bank size"))?;
        Ok(Self { filters })
    }

    /// Filter every joint.
    pub fn update(&mut self, x: &JointVector) -> JointVector {
        let mut out = [0.0; NUM_JOINTS];
        for ((o, f), v) in out.iter_mut().zip(self.filters.iter_mut()).zip(x.iter()) {
            *o = f.update(*v);
        }
        out
    }

    /// Reset every joint filter.
    pub fn reset(&mut self) {
        self.filters.iter_mut().for_each(LowPassFilter::reset);
    }

    /// True if any joint filter holds state.
    pub fn is_initialized(&self) -> bool {
        self.filters.iter().any(LowPassFilter::is_initialized)
    }

    /// Access a single joint filter.
    pub fn filter(&self, joint: usize) -> &LowPassFilter {
        &self.filters[joint]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_first_sample_passes_through() {
        let mut f = LowPassFilter::new(2.0, 30.0);
        assert!(!f.is_initialized());
        assert_eq!(f.update(1.234), 1.234);
        assert!(f.is_initialized());
    }

    #[test]
    fn test_alpha_matches_rc_formula() {
        let f = LowPassFilter::new(3.0, 20.0);
        let dt = 1.0 / 20.0;
        let rc = 1.0 / (2.0 * PI * 3.0);
        assert_relative_eq!(f.alpha(), dt / (rc + dt));
    }

    #[test]
    fn test_converges_monotonically_to_constant() {
        for (fc, fs) in [(2.0, 30.0), (5.0, 20.0), (0.5, 100.0)] {
            let mut f = LowPassFilter::new(fc, fs);
            f.update(0.0);
            let mut prev = 0.0;
            for _ in 0..2000 {
                let y = f.update(1.0);
                assert!(y >= prev - 1e-12 && y <= 1.0 + 1e-12);
                prev = y;
            }
            assert_relative_eq!(prev, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_reset_restores_pass_through() {
        let mut f = LowPassFilter::new(2.0, 30.0);
        f.update(0.0);
        f.update(1.0);
        f.reset();
        assert!(!f.is_initialized());
        assert_eq!(f.update(-0.7), -0.7);
    }

    #[test]
    fn test_try_new_rejects_bad_parameters() {
        assert!(LowPassFilter::try_new(0.0, 30.0).is_err());
        assert!(LowPassFilter::try_new(2.0, -1.0).is_err());
        assert!(LowPassFilter::try_new(f64::NAN, 30.0).is_err());
        assert!(LowPassFilter::try_new(2.0, 30.0).is_ok());
    }

    #[test]
    fn test_bank_filters_joints_independently() {
        let mut bank = FilterBank::new(&[2.0, 3.0, 4.0, 5.0, 5.0, 5.0], 30.0).unwrap();
        assert!(!bank.is_initialized());
        let first = bank.update(&[1.0; NUM_JOINTS]);
        assert_eq!(first, [1.0; NUM_JOINTS]);
        let second = bank.update(&[0.0; NUM_JOINTS]);
        // Higher cutoff reacts faster.
        assert!(second[0] > second[3]);
        bank.reset();
        assert!(!bank.is_initialized());
        assert_eq!(bank.update(&[9.0; NUM_JOINTS]), [9.0; NUM_JOINTS]);
    }
}
