//! Zero-position alignment between leader and follower.
//!
//! Teleoperation uses relative motion: wherever the leader sits once its
//! signal has settled becomes the follower's local origin. Until then the
//! follower is held at the pose it had on the first observed tick.

use crate::types::{ArmState, JointVector, NUM_JOINTS};

/// Default number of ticks to wait before trusting the leader as stationary.
pub const DEFAULT_SETTLE_TICKS: u32 = 10;

/// Tracker phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlignmentPhase {
    /// Waiting for the leader signal to settle.
    Waiting,
    /// Zero captured; leader displacement is being tracked.
    Aligned,
}

/// Result of feeding one tick to the tracker.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AlignmentStep {
    /// Keep the follower at this pose.
    Hold(ArmState),
    /// Leader displacement from the captured zero.
    Relative {
        /// `leader - leader_zero`, per joint.
        delta: JointVector,
        /// Set on the tick that performed the alignment.
        just_aligned: bool,
    },
}

/// Records leader and follower reference poses and converts leader readings
/// into displacements.
#[derive(Clone, Debug)]
pub struct ZeroAlignmentTracker {
    settle_ticks: u32,
    waited: u32,
    hold_pose: Option<ArmState>,
    leader_zero: Option<JointVector>,
    follower_zero: Option<JointVector>,
}

impl ZeroAlignmentTracker {
    /// Create a tracker that aligns after `settle_ticks` waiting ticks.
    pub fn new(settle_ticks: u32) -> Self {
        Self {
            settle_ticks,
            waited: 0,
            hold_pose: None,
            leader_zero: None,
            follower_zero: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> AlignmentPhase {
        if self.leader_zero.is_some() {
            AlignmentPhase::Aligned
        } else {
            AlignmentPhase::Waiting
        }
    }

    /// Feed the current leader joints and follower state.
    pub fn observe(&mut self, leader: &JointVector, follower: &ArmState) -> AlignmentStep {
        if let Some(zero) = self.leader_zero {
            return AlignmentStep::Relative {
                delta: displacement(leader, &zero),
                just_aligned: false,
            };
        }

        if self.waited < self.settle_ticks {
            let pose = *self.hold_pose.get_or_insert(*follower);
            self.waited += 1;
            return AlignmentStep::Hold(pose);
        }

        self.leader_zero = Some(*leader);
        self.follower_zero = Some(follower.joints);
        self.hold_pose.get_or_insert(*follower);
        tracing::info!(
            "Zero aligned: leader {:.2?}, follower {}",
            leader,
            crate::types::fmt_degrees(&follower.joints)
        );
        AlignmentStep::Relative {
            delta: [0.0; NUM_JOINTS],
            just_aligned: true,
        }
    }

    /// Return to `Waiting`; the follower's pose at the next tick becomes the new reference.
    pub fn reset(&mut self) {
        self.waited = 0;
        self.hold_pose = None;
        self.leader_zero = None;
        self.follower_zero = None;
    }

    /// Leader pose captured at alignment.
    pub fn leader_zero(&self) -> Option<&JointVector> {
        self.leader_zero.as_ref()
    }

    /// Raw follower joint pose captured at alignment.
    pub fn follower_zero(&self) -> Option<&JointVector> {
        self.follower_zero.as_ref()
    }

    /// Pose held while waiting.
    pub fn hold_pose(&self) -> Option<&ArmState> {
        self.hold_pose.as_ref()
    }

    /// Waiting ticks consumed so far.
    pub fn waited(&self) -> u32 {
        self.waited
    }
}

fn displacement(current: &JointVector, zero: &JointVector) -> JointVector {
    let mut out = [0.0; NUM_JOINTS];
    for (o, (c, z)) in out.iter_mut().zip(current.iter().zip(zero.iter())) {
        *o = c - z;
    }
    out
}
