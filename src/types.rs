//! Platform-independent arm state types.
//!
//! Buses report readings as an [`Observation`], a flat map keyed like
//! `joint_0.pos` … `joint_5.pos` and `gripper.pos`. The core parses those
//! into an [`ArmState`] and emits an [`ArmCommand`]; a missing or non-finite
//! field is a contract violation and is reported, never defaulted.

use crate::error::TeleopError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of arm joints (excluding the gripper).
pub const NUM_JOINTS: usize = 6;

/// Joint angles, index-aligned between leader and follower.
pub type JointVector = [f64; NUM_JOINTS];

/// Observation key of the gripper position.
pub const GRIPPER_KEY: &str = "gripper.pos";

/// Observation key for joint `index`.
pub fn joint_key(index: usize) -> String {
    format!("joint_{}.pos", index)
}

/// Raw readings reported by a bus.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    fields: BTreeMap<String, f64>,
}

impl Observation {
    /// Create an empty observation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field.
    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.fields.insert(key.into(), value);
    }

    /// Remove a field, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<f64> {
        self.fields.remove(key)
    }

    /// Look up a field that must be present and finite.
    pub fn get(&self, key: &str) -> Result<f64, TeleopError> {
        let value = *self
            .fields
            .get(key)
            .ok_or_else(|| TeleopError::MissingField(key.to_string()))?;
        if !value.is_finite() {
            return Err(TeleopError::NonFinite {
                key: key.to_string(),
                value,
            });
        }
        Ok(value)
    }

    /// Look up a field without validation.
    pub fn get_raw(&self, key: &str) -> Option<f64> {
        self.fields.get(key).copied()
    }

    /// Iterate over all fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when no fields are set.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Joint positions plus gripper, as read from one arm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArmState {
    /// Joint positions.
    pub joints: JointVector,
    /// Gripper position in the arm's own range.
    pub gripper: f64,
}

/// Target joint positions and gripper sent to the follower.
pub type ArmCommand = ArmState;

impl ArmState {
    /// Create a state from joints and gripper.
    pub fn new(joints: JointVector, gripper: f64) -> Self {
        Self { joints, gripper }
    }

    /// Parse from an observation, failing on any missing or non-finite field.
    pub fn from_observation(obs: &Observation) -> Result<Self, TeleopError> {
        let mut joints = [0.0; NUM_JOINTS];
        for (i, joint) in joints.iter_mut().enumerate() {
            *joint = obs.get(&joint_key(i))?;
        }
        Ok(Self {
            joints,
            gripper: obs.get(GRIPPER_KEY)?,
        })
    }

    /// Convert into the keyed observation form.
    pub fn to_observation(&self) -> Observation {
        let mut obs = Observation::new();
        for (i, joint) in self.joints.iter().enumerate() {
            obs.insert(joint_key(i), *joint);
        }
        obs.insert(GRIPPER_KEY, self.gripper);
        obs
    }

    /// Linear interpolation towards `target`; `ratio` 0 is `self`, 1 is `target`.
    pub fn lerp(&self, target: &ArmState, ratio: f64) -> ArmState {
        let mut joints = self.joints;
        for (j, t) in joints.iter_mut().zip(target.joints.iter()) {
            *j += (t - *j) * ratio;
        }
        ArmState {
            joints,
            gripper: self.gripper + (target.gripper - self.gripper) * ratio,
        }
    }
}

/// Format a joint vector in degrees for log lines.
pub fn fmt_degrees(joints: &JointVector) -> String {
    let parts: Vec<String> = joints
        .iter()
        .map(|r| format!("{:.1}°", r.to_degrees()))
        .collect();
    format!("[{}]", parts.join(", "))
}
