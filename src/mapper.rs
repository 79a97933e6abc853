//! Leader-to-follower safe mapping.
//!
//! One [`SafeTeleopMapper`] owns every piece of per-session state: alignment,
//! filters, dead-band memory and the offset ramp. Each control tick feeds it
//! one leader observation and one follower observation and gets back one
//! follower command that is guaranteed to be inside the soft limits.
//!
//! Per tick, strictly in order:
//!
//! 1. zero alignment (hold the follower until the leader has settled)
//! 2. leader displacement from the captured zero
//! 3. `sign · displacement · angular_scale · gear_ratio`
//! 4. per-joint low-pass filter
//! 5. dead-band against the last value sent
//! 6. offset ramp blend of the follower reference pose
//! 7. reference + delta, clamped to soft limits
//! 8. gripper unit conversion
//!
//! # Example
//!
//! ```
//! use arx_teleop::config::SafetyConfig;
//! use arx_teleop::mapper::SafeTeleopMapper;
//! use arx_teleop::types::ArmState;
//!
//! let mut mapper = SafeTeleopMapper::new(&SafetyConfig::default(), 30.0)?;
//! let leader = ArmState::new([0.0; 6], 40.0).to_observation();
//! let follower = ArmState::new([1.57, 0.2, 0.2, 0.0, 0.0, 0.0], 0.0).to_observation();
//! let command = mapper.step(&leader, &follower)?;
//! assert_eq!(command.joints[0], 1.57);
//! # Ok::<(), arx_teleop::TeleopError>(())
//! ```

use crate::alignment::{AlignmentPhase, AlignmentStep, ZeroAlignmentTracker};
use crate::config::{GripperMapping, SafetyConfig};
use crate::error::{joint_table, TeleopError};
use crate::filter::FilterBank;
use crate::limits::JointLimiter;
use crate::ramp::OffsetRamp;
use crate::types::{ArmCommand, ArmState, JointVector, Observation, NUM_JOINTS};

/// Stateful leader-to-follower transform.
#[derive(Clone, Debug)]
pub struct SafeTeleopMapper {
    tracker: ZeroAlignmentTracker,
    filters: FilterBank,
    limiter: JointLimiter,
    ramp: OffsetRamp,
    deadband: JointVector,
    gear_ratio: JointVector,
    joint_sign: JointVector,
    angular_scale: f64,
    gripper: GripperMapping,
    auto_zero_joints: Vec<usize>,
    last_sent: Option<JointVector>,
    ticks: u64,
}

impl SafeTeleopMapper {
    /// Build a mapper for a control loop running at `rate_hz`.
    pub fn new(config: &SafetyConfig, rate_hz: f64) -> Result<Self, TeleopError> {
        config.validate()?;
        let cutoffs = joint_table("cutoff_hz", &config.cutoff_hz)?;
        let limiter = JointLimiter::new(joint_table("joint_limits", &config.joint_limits)?)?
            .with_reporting(config.limit_tolerance, config.limit_warn_every);

        Ok(Self {
            tracker: ZeroAlignmentTracker::new(config.settle_ticks),
            filters: FilterBank::new(&cutoffs, rate_hz)?,
            limiter,
            ramp: OffsetRamp::new(
                joint_table("follower_offset", &config.follower_offset)?,
                config.transition_time_s,
                rate_hz,
            ),
            deadband: joint_table("deadband", &config.deadband)?,
            gear_ratio: joint_table("gear_ratio", &config.gear_ratio)?,
            joint_sign: joint_table("joint_sign", &config.joint_sign)?,
            angular_scale: config.angular_scale,
            gripper: config.gripper,
            auto_zero_joints: config.auto_zero_joints.clone(),
            last_sent: None,
            ticks: 0,
        })
    }

    /// Map one pair of observations to a follower command.
    ///
    /// Fails if either observation lacks a joint or gripper field.
    pub fn step(
        &mut self,
        leader: &Observation,
        follower: &Observation,
    ) -> Result<ArmCommand, TeleopError> {
        let leader = ArmState::from_observation(leader)?;
        let follower = ArmState::from_observation(follower)?;
        Ok(self.step_state(&leader, &follower))
    }

    /// Typed variant of [`step`](Self::step).
    ///
    /// Hold ticks replay the captured follower pose unclamped; only aligned
    /// ticks are bounded by the soft joint limits.
    pub fn step_state(&mut self, leader: &ArmState, follower: &ArmState) -> ArmCommand {
        let tick = self.ticks;
        self.ticks += 1;

        let delta = match self.tracker.observe(&leader.joints, follower) {
            AlignmentStep::Hold(pose) => return pose,
            AlignmentStep::Relative {
                delta,
                just_aligned,
            } => {
                if just_aligned {
                    self.ramp.start();
                }
                delta
            }
        };

        let mut target = [0.0; NUM_JOINTS];
        for (i, t) in target.iter_mut().enumerate() {
            *t = self.joint_sign[i] * delta[i] * self.angular_scale * self.gear_ratio[i];
        }

        let filtered = self.filters.update(&target);
        let held = self.apply_deadband(&filtered);

        self.ramp.advance();
        let base = self.ramp.blend(self.reference());
        let mut absolute = [0.0; NUM_JOINTS];
        for (i, a) in absolute.iter_mut().enumerate() {
            *a = base[i] + held[i];
        }

        ArmCommand {
            joints: self.limiter.clamp_all(&absolute, tick),
            gripper: self.gripper.map(leader.gripper),
        }
    }

    fn apply_deadband(&mut self, filtered: &JointVector) -> JointVector {
        let out = match self.last_sent {
            None => *filtered,
            Some(last) => {
                let mut out = *filtered;
                for (i, o) in out.iter_mut().enumerate() {
                    if (filtered[i] - last[i]).abs() < self.deadband[i] {
                        *o = last[i];
                    }
                }
                out
            }
        };
        self.last_sent = Some(out);
        out
    }

    fn reference(&self) -> &JointVector {
        // Only reached after alignment, which always records the follower pose.
        static ZERO: JointVector = [0.0; NUM_JOINTS];
        self.tracker.follower_zero().unwrap_or(&ZERO)
    }

    /// Compute offsets for the auto-zero joints from the follower's power-on pose,
    /// so that the offset ramp brings those joints to 0 rad.
    pub fn compensate_offsets(&mut self, follower: &ArmState) {
        for &joint in &self.auto_zero_joints {
            let offset = -follower.joints[joint];
            tracing::info!(
                "Joint {} at {:.1}° on power-up, offset {:.1}°",
                joint,
                follower.joints[joint].to_degrees(),
                offset.to_degrees()
            );
            self.ramp.set_offset(joint, offset);
        }
    }

    /// Prepare for the next recorded episode.
    ///
    /// Re-zeros against wherever the leader is next, forgets filter and
    /// dead-band state and drops the static offset: the follower already sits
    /// at the working pose, so no second ramp is wanted.
    pub fn reset_for_new_episode(&mut self) {
        self.tracker.reset();
        self.filters.reset();
        self.last_sent = None;
        self.ramp.clear();
        self.ticks = 0;
        tracing::info!("Zero alignment reset, continuing from current pose without offset");
    }

    /// Alignment phase.
    pub fn phase(&self) -> AlignmentPhase {
        self.tracker.phase()
    }

    /// True once the zero pose has been captured.
    pub fn is_aligned(&self) -> bool {
        self.tracker.phase() == AlignmentPhase::Aligned
    }

    /// True while the offset ramp is moving.
    pub fn in_transition(&self) -> bool {
        self.ramp.in_transition()
    }

    /// Current offset blend ratio.
    pub fn ramp_ratio(&self) -> f64 {
        self.ramp.ratio()
    }

    /// Configured follower offset.
    pub fn offset(&self) -> &JointVector {
        self.ramp.offset()
    }

    /// True if any joint filter holds state.
    pub fn filters_initialized(&self) -> bool {
        self.filters.is_initialized()
    }

    /// Ticks processed since construction or the last episode reset.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Alignment tracker, read-only.
    pub fn tracker(&self) -> &ZeroAlignmentTracker {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::JointLimit;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    fn plain_config() -> SafetyConfig {
        SafetyConfig {
            deadband: vec![0.0; NUM_JOINTS],
            joint_sign: vec![1.0; NUM_JOINTS],
            gear_ratio: vec![1.0; NUM_JOINTS],
            ..SafetyConfig::default()
        }
    }

    fn leader(j0: f64, gripper: f64) -> ArmState {
        ArmState::new([j0, 0.0, 0.0, 0.0, 0.0, 0.0], gripper)
    }

    fn follower_home() -> ArmState {
        ArmState::new([0.0, 0.5, 0.5, 0.0, 0.0, 0.0], 200.0)
    }

    #[test]
    fn test_hold_is_idempotent_while_waiting() {
        let mut mapper = SafeTeleopMapper::new(&plain_config(), 30.0).unwrap();
        let home = follower_home();
        for i in 0..10 {
            let leader = ArmState::new([i as f64 * 13.0 - 40.0; NUM_JOINTS], i as f64 * 9.0);
            let out = mapper.step_state(&leader, &home);
            assert_eq!(out, home);
            assert!(!mapper.is_aligned());
        }
        mapper.step_state(&leader(0.0, 0.0), &home);
        assert!(mapper.is_aligned());
    }

    #[test]
    fn test_hold_replays_pose_outside_limits() {
        let config = plain_config();
        let mut mapper = SafeTeleopMapper::new(&config, 30.0).unwrap();
        let beyond = ArmState::new([0.0, 3.8, 0.5, 0.0, 0.0, 0.0], 0.0);
        for _ in 0..config.settle_ticks {
            assert_eq!(mapper.step_state(&leader(0.0, 0.0), &beyond), beyond);
        }
        let out = mapper.step_state(&leader(0.0, 0.0), &beyond);
        assert!(mapper.is_aligned());
        assert_eq!(out.joints[1], 3.60);
    }

    #[test]
    fn test_leader_at_zero_reproduces_base_pose() {
        let mut mapper = SafeTeleopMapper::new(&plain_config(), 30.0).unwrap();
        let home = follower_home();
        let zero = ArmState::new([12.0, -30.0, 4.0, 55.0, 0.0, -8.0], 50.0);
        for _ in 0..30 {
            let out = mapper.step_state(&zero, &home);
            assert_eq!(out.joints, home.joints);
        }
    }

    #[test]
    fn test_joint0_displacement_scenario() {
        let mut mapper = SafeTeleopMapper::new(&plain_config(), 30.0).unwrap();
        let home = follower_home();
        for _ in 0..10 {
            mapper.step_state(&leader(0.0, 0.0), &home);
        }
        // Alignment tick.
        let out = mapper.step_state(&leader(0.0, 0.0), &home);
        assert_eq!(out.joints[0], 0.0);

        let expected = 10.0 * FRAC_PI_2 / 100.0;
        let mut prev = 0.0;
        for _ in 0..300 {
            let out = mapper.step_state(&leader(10.0, 0.0), &home);
            let j0 = out.joints[0];
            assert!(j0 >= prev - 1e-12 && j0 <= expected + 1e-12);
            assert!(j0 <= 3.05);
            prev = j0;
        }
        assert_relative_eq!(prev, expected, epsilon = 1e-6);
        assert_relative_eq!(prev, 0.157, epsilon = 1e-3);
    }

    #[test]
    fn test_sign_and_gear_ratio() {
        let mut config = plain_config();
        config.settle_ticks = 0;
        config.cutoff_hz = vec![1000.0; NUM_JOINTS];
        config.joint_sign = vec![-1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        config.gear_ratio = vec![1.0, 1.0, 1.0, 2.0, 1.0, 1.0];
        config.joint_limits = vec![JointLimit::new(-10.0, 10.0); NUM_JOINTS];
        let mut mapper = SafeTeleopMapper::new(&config, 30.0).unwrap();
        let still = ArmState::new([0.0; NUM_JOINTS], 0.0);
        mapper.step_state(&ArmState::default(), &still);

        let moved = ArmState::new([20.0, 0.0, 0.0, 20.0, 0.0, 0.0], 0.0);
        let mut out = ArmCommand::default();
        for _ in 0..50 {
            out = mapper.step_state(&moved, &still);
        }
        let unit = 20.0 * FRAC_PI_2 / 100.0;
        assert_relative_eq!(out.joints[0], -unit, epsilon = 1e-9);
        assert_relative_eq!(out.joints[3], 2.0 * unit, epsilon = 1e-9);
    }

    #[test]
    fn test_target_beyond_limit_is_clamped() {
        let mut config = plain_config();
        config.settle_ticks = 0;
        let mut mapper = SafeTeleopMapper::new(&config, 30.0).unwrap();
        let follower = ArmState::new([0.0, 3.5, 0.0, 0.0, 0.0, 0.0], 0.0);
        mapper.step_state(&ArmState::default(), &follower);
        // +100 leader units on joint 1 ≈ +1.57 rad on top of 3.5 rad.
        let far = ArmState::new([0.0, 100.0, 0.0, 0.0, 0.0, 0.0], 0.0);
        for _ in 0..200 {
            let out = mapper.step_state(&far, &follower);
            assert!(out.joints[1] <= 3.60);
        }
        assert_eq!(mapper.step_state(&far, &follower).joints[1], 3.60);
    }

    #[test]
    fn test_deadband_suppresses_small_changes() {
        let mut config = plain_config();
        config.settle_ticks = 0;
        config.cutoff_hz = vec![1000.0; NUM_JOINTS];
        config.deadband = vec![0.05; NUM_JOINTS];
        config.joint_limits = vec![JointLimit::new(-10.0, 10.0); NUM_JOINTS];
        let mut mapper = SafeTeleopMapper::new(&config, 30.0).unwrap();
        let still = ArmState::default();
        let first = mapper.step_state(&ArmState::default(), &still);

        // 1 leader unit ≈ 0.0157 rad, well inside the 0.05 rad band.
        let second = mapper.step_state(&leader(1.0, 0.0), &still);
        assert_eq!(second.joints, first.joints);

        // 10 units ≈ 0.157 rad escapes it.
        let third = mapper.step_state(&leader(10.0, 0.0), &still);
        assert!(third.joints[0] > 0.1);
    }

    #[test]
    fn test_gripper_conversion() {
        let mut config = plain_config();
        config.settle_ticks = 0;
        let mut mapper = SafeTeleopMapper::new(&config, 30.0).unwrap();
        let out = mapper.step_state(&leader(0.0, 55.0), &follower_home());
        assert_eq!(out.gripper, 550.0);
        let out = mapper.step_state(&leader(0.0, 140.0), &follower_home());
        assert_eq!(out.gripper, 1000.0);
    }

    #[test]
    fn test_offset_ramp_moves_base_pose() {
        let mut config = plain_config();
        config.settle_ticks = 0;
        config.follower_offset = vec![FRAC_PI_2, 0.0, 0.0, 0.0, 0.0, 0.0];
        config.transition_time_s = 1.0;
        let mut mapper = SafeTeleopMapper::new(&config, 30.0).unwrap();
        let home = follower_home();
        let still = leader(0.0, 0.0);

        let first = mapper.step_state(&still, &home);
        assert!(mapper.in_transition());
        assert_relative_eq!(first.joints[0], FRAC_PI_2 / 30.0, epsilon = 1e-12);

        let mut prev = first.joints[0];
        for _ in 1..30 {
            let out = mapper.step_state(&still, &home);
            assert!(out.joints[0] >= prev);
            prev = out.joints[0];
        }
        assert!(!mapper.in_transition());
        assert_relative_eq!(prev, FRAC_PI_2, epsilon = 1e-12);
        assert_eq!(mapper.ramp_ratio(), 1.0);
    }

    #[test]
    fn test_missing_field_fails_fast() {
        let mut mapper = SafeTeleopMapper::new(&plain_config(), 30.0).unwrap();
        let mut leader_obs = leader(0.0, 0.0).to_observation();
        leader_obs.remove("gripper.pos");
        let follower_obs = follower_home().to_observation();
        assert_eq!(
            mapper.step(&leader_obs, &follower_obs),
            Err(TeleopError::MissingField("gripper.pos".to_string()))
        );
        // Nothing was consumed.
        assert_eq!(mapper.ticks(), 0);
    }

    #[test]
    fn test_episode_reset() {
        let mut config = plain_config();
        config.settle_ticks = 2;
        config.follower_offset = vec![FRAC_PI_2, 0.0, 0.0, 0.0, 0.0, 0.0];
        let mut mapper = SafeTeleopMapper::new(&config, 30.0).unwrap();
        for _ in 0..20 {
            mapper.step_state(&leader(5.0, 10.0), &follower_home());
        }
        assert!(mapper.is_aligned());
        assert!(mapper.filters_initialized());

        mapper.reset_for_new_episode();
        assert_eq!(mapper.phase(), AlignmentPhase::Waiting);
        assert!(!mapper.filters_initialized());
        assert_eq!(mapper.offset(), &[0.0; NUM_JOINTS]);
        assert_eq!(mapper.ticks(), 0);

        // The arm now rests at the working pose; it is held there, then aligned
        // without any further offset motion.
        let working = ArmState::new([FRAC_PI_2, 0.5, 0.5, 0.0, 0.0, 0.0], 100.0);
        for _ in 0..2 {
            assert_eq!(mapper.step_state(&leader(-20.0, 0.0), &working), working);
        }
        let out = mapper.step_state(&leader(-20.0, 0.0), &working);
        assert!(!mapper.in_transition());
        assert_eq!(out.joints, working.joints);
    }

    #[test]
    fn test_auto_zero_offset() {
        let mut config = plain_config();
        config.settle_ticks = 0;
        config.transition_time_s = 0.1;
        config.auto_zero_joints = vec![5];
        let mut mapper = SafeTeleopMapper::new(&config, 30.0).unwrap();
        let powered = ArmState::new([0.0, 0.5, 0.5, 0.0, 0.0, 0.4], 0.0);
        mapper.compensate_offsets(&powered);
        assert_eq!(mapper.offset()[5], -0.4);
        let mut out = ArmCommand::default();
        for _ in 0..10 {
            out = mapper.step_state(&leader(0.0, 0.0), &powered);
        }
        assert_relative_eq!(out.joints[5], 0.0, epsilon = 1e-12);
    }
}
