//! Time-bounded linear ramps.
//!
//! [`OffsetRamp`] carries the follower's reference pose from where it powered
//! up to a configured offset pose. [`ReturnRamp`] drives the follower back to
//! a parking pose before shutdown or between episodes.

use crate::types::{ArmCommand, ArmState, JointVector, NUM_JOINTS};

/// Offsets at or below this magnitude (radians) do not start a transition.
pub const OFFSET_EPSILON: f64 = 0.01;

/// Progress is logged every this many ramp ticks.
const PROGRESS_EVERY: u32 = 30;

/// Blends the raw follower reference towards `raw + offset`.
#[derive(Clone, Debug)]
pub struct OffsetRamp {
    offset: JointVector,
    total_ticks: u32,
    elapsed: u32,
    transitioning: bool,
    ratio: f64,
}

impl OffsetRamp {
    /// Create a ramp that completes after `transition_time_s × tick_rate_hz` ticks.
    pub fn new(offset: JointVector, transition_time_s: f64, tick_rate_hz: f64) -> Self {
        let total_ticks = (transition_time_s * tick_rate_hz).round().max(0.0) as u32;
        Self {
            offset,
            total_ticks,
            elapsed: 0,
            transitioning: false,
            ratio: 0.0,
        }
    }

    /// True when the offset is too small to need a transition.
    pub fn is_noop(&self) -> bool {
        self.offset.iter().all(|o| o.abs() <= OFFSET_EPSILON)
    }

    /// Begin the transition; called on the tick that aligns the follower.
    pub fn start(&mut self) {
        self.elapsed = 0;
        self.transitioning = !self.is_noop();
        self.ratio = if self.transitioning { 0.0 } else { 1.0 };
        if self.transitioning {
            tracing::info!(
                "Ramping to follower offset {} over {} ticks",
                crate::types::fmt_degrees(&self.offset),
                self.total_ticks
            );
        }
    }

    /// Advance one tick and return the current blend ratio.
    pub fn advance(&mut self) -> f64 {
        if !self.transitioning {
            self.ratio = 1.0;
            return self.ratio;
        }
        self.elapsed += 1;
        self.ratio = if self.total_ticks == 0 {
            1.0
        } else {
            (self.elapsed as f64 / self.total_ticks as f64).min(1.0)
        };
        if self.elapsed % PROGRESS_EVERY == 0 {
            tracing::debug!(
                "Offset ramp {:.0}% ({}/{})",
                self.ratio * 100.0,
                self.elapsed,
                self.total_ticks
            );
        }
        if self.ratio >= 1.0 {
            self.transitioning = false;
            tracing::info!("Offset transition complete, normal teleoperation");
        }
        self.ratio
    }

    /// Effective base pose: `raw·(1-r) + (raw+offset)·r`, i.e. `raw + offset·r`.
    pub fn blend(&self, raw: &JointVector) -> JointVector {
        let mut out = *raw;
        for (o, off) in out.iter_mut().zip(self.offset.iter()) {
            *o += off * self.ratio;
        }
        out
    }

    /// Zero the offset and progress; later alignments do not ramp.
    pub fn clear(&mut self) {
        self.offset = [0.0; NUM_JOINTS];
        self.elapsed = 0;
        self.transitioning = false;
        self.ratio = 0.0;
    }

    /// Replace one joint's offset.
    pub fn set_offset(&mut self, joint: usize, value: f64) {
        self.offset[joint] = value;
    }

    /// Whether a transition is in progress.
    pub fn in_transition(&self) -> bool {
        self.transitioning
    }

    /// Current blend ratio.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Ticks advanced so far.
    pub fn elapsed(&self) -> u32 {
        self.elapsed
    }

    /// Ticks needed to saturate.
    pub fn total_ticks(&self) -> u32 {
        self.total_ticks
    }

    /// Configured offset.
    pub fn offset(&self) -> &JointVector {
        &self.offset
    }
}

/// Interpolated commands from a start state to a parking pose.
///
/// Yields `steps` commands with ratio `(k+1)/steps`, so the last one is the
/// target itself.
#[derive(Clone, Debug)]
pub struct ReturnRamp {
    start: ArmState,
    target: ArmCommand,
    steps: u32,
    next: u32,
}

impl ReturnRamp {
    /// Ramp over `return_time_s` at `rate_hz` ticks per second (at least one step).
    pub fn new(start: ArmState, target: ArmCommand, return_time_s: f64, rate_hz: f64) -> Self {
        let steps = ((return_time_s * rate_hz).round() as u32).max(1);
        Self {
            start,
            target,
            steps,
            next: 0,
        }
    }

    /// Total number of commands.
    pub fn steps(&self) -> u32 {
        self.steps
    }
}

impl Iterator for ReturnRamp {
    type Item = ArmCommand;

    fn next(&mut self) -> Option<ArmCommand> {
        if self.next >= self.steps {
            return None;
        }
        self.next += 1;
        if self.next == self.steps {
            return Some(self.target);
        }
        let ratio = self.next as f64 / self.steps as f64;
        Some(self.start.lerp(&self.target, ratio))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.steps - self.next) as usize;
        (left, Some(left))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_ratio_saturates_exactly_at_total_ticks() {
        let mut ramp = OffsetRamp::new([FRAC_PI_2, 0.0, 0.0, 0.0, 0.0, 0.0], 3.0, 30.0);
        assert_eq!(ramp.total_ticks(), 90);
        ramp.start();
        assert!(ramp.in_transition());

        let mut prev = 0.0;
        for tick in 1..=90 {
            let r = ramp.advance();
            assert!(r >= prev);
            if tick < 90 {
                assert!(r < 1.0);
            }
            prev = r;
        }
        assert_eq!(prev, 1.0);
        assert!(!ramp.in_transition());
        // Held at 1 afterwards.
        assert_eq!(ramp.advance(), 1.0);
        assert_eq!(ramp.elapsed(), 90);
    }

    #[test]
    fn test_blend_interpolates_towards_offset() {
        let mut ramp = OffsetRamp::new([1.0, 0.0, 0.0, -0.5, 0.0, 0.0], 1.0, 4.0);
        ramp.start();
        let raw = [0.2, 0.3, 0.0, 0.0, 0.0, 0.0];
        ramp.advance();
        ramp.advance();
        let mid = ramp.blend(&raw);
        assert_relative_eq!(mid[0], 0.2 * 0.5 + 1.2 * 0.5);
        assert_eq!(mid[1], 0.3);
        assert_eq!(mid[3], -0.25);
    }

    #[test]
    fn test_zero_offset_is_identity() {
        let mut ramp = OffsetRamp::new([0.0; NUM_JOINTS], 3.0, 30.0);
        ramp.start();
        assert!(ramp.is_noop());
        assert!(!ramp.in_transition());
        let raw = [0.1, -0.2, 0.3, -0.4, 0.5, -0.6];
        for _ in 0..5 {
            ramp.advance();
            assert_eq!(ramp.blend(&raw), raw);
        }
    }

    #[test]
    fn test_clear_zeroes_offset_and_progress() {
        let mut ramp = OffsetRamp::new([FRAC_PI_2, 0.0, 0.0, 0.0, 0.0, 0.0], 1.0, 10.0);
        ramp.start();
        ramp.advance();
        ramp.clear();
        assert_eq!(ramp.offset(), &[0.0; NUM_JOINTS]);
        assert_eq!(ramp.elapsed(), 0);
        ramp.start();
        assert!(!ramp.in_transition());
    }

    #[test]
    fn test_return_ramp_ends_at_target() {
        let start = ArmState::new([1.0, 1.0, 1.0, 1.0, 1.0, 1.0], 500.0);
        let park = ArmState::new([FRAC_PI_2, 0.0, 0.0, 0.0, 0.0, 0.0], 0.0);
        let ramp = ReturnRamp::new(start, park, 3.0, 30.0);
        assert_eq!(ramp.steps(), 90);
        let cmds: Vec<_> = ramp.collect();
        assert_eq!(cmds.len(), 90);
        assert_eq!(cmds.last().unwrap().joints, park.joints);
        assert_eq!(cmds.last().unwrap().gripper, 0.0);
        // Moves monotonically towards the target.
        for pair in cmds.windows(2) {
            assert!(pair[1].joints[1] <= pair[0].joints[1]);
        }
    }
}
