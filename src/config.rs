//! Deployment configuration.
//!
//! Everything is loaded from a single JSON file; omitted fields fall back to
//! the defaults of the ARX-X5 + Feetech rig.
//!
//! ```no_run
//! use arx_teleop::config::TeleopConfig;
//!
//! let config = TeleopConfig::load("configs/arx_x5_record.json")?;
//! println!("control rate: {} Hz", config.rate_hz);
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::alignment::DEFAULT_SETTLE_TICKS;
use crate::error::{joint_table, TeleopError};
use crate::limits::{JointLimit, ARX_X5_LIMITS, DEFAULT_LIMIT_TOLERANCE, DEFAULT_WARN_EVERY};
use crate::types::{ArmCommand, NUM_JOINTS};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Leader gripper (0..100) to follower gripper (0..1000) conversion.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GripperMapping {
    /// Multiplier applied to the leader reading.
    pub scale: f64,
    /// Lowest follower command.
    pub min: f64,
    /// Highest follower command.
    pub max: f64,
}

impl Default for GripperMapping {
    fn default() -> Self {
        Self {
            scale: 10.0,
            min: 0.0,
            max: 1000.0,
        }
    }
}

impl GripperMapping {
    /// `clamp(leader × scale, min, max)`.
    pub fn map(&self, leader: f64) -> f64 {
        self.max.min(self.min.max(leader * self.scale))
    }
}

/// Parameters of the safe mapping pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Soft limits per joint (radians).
    pub joint_limits: Vec<JointLimit>,
    /// Low-pass cutoff per joint (Hz).
    pub cutoff_hz: Vec<f64>,
    /// Dead-band per joint (radians); 0 disables it for that joint.
    pub deadband: Vec<f64>,
    /// Follower/leader angular ratio per joint.
    pub gear_ratio: Vec<f64>,
    /// +1 or -1 per joint for mechanically mirrored joints.
    pub joint_sign: Vec<f64>,
    /// Leader units to radians.
    pub angular_scale: f64,
    /// Static offset added to the follower's reference pose (radians).
    pub follower_offset: Vec<f64>,
    /// Joints whose offset is computed at startup so they ramp to 0 rad.
    pub auto_zero_joints: Vec<usize>,
    /// Ticks to wait before capturing the zero pose.
    pub settle_ticks: u32,
    /// Duration of the offset ramp (seconds).
    pub transition_time_s: f64,
    /// Gripper conversion.
    pub gripper: GripperMapping,
    /// Clamp correction (radians) above which a warning is logged.
    pub limit_tolerance: f64,
    /// Emit limit warnings only every this many ticks.
    pub limit_warn_every: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            joint_limits: ARX_X5_LIMITS.to_vec(),
            cutoff_hz: vec![2.0, 3.0, 4.0, 5.0, 5.0, 5.0],
            deadband: vec![0.0, 0.017, 0.012, 0.026, 0.026, 0.026],
            gear_ratio: vec![1.0; NUM_JOINTS],
            joint_sign: vec![-1.0, -1.0, 1.0, 1.0, 1.0, 1.0],
            // -100..100 leader units span 180°.
            angular_scale: FRAC_PI_2 / 100.0,
            follower_offset: vec![0.0; NUM_JOINTS],
            auto_zero_joints: Vec::new(),
            settle_ticks: DEFAULT_SETTLE_TICKS,
            transition_time_s: 3.0,
            gripper: GripperMapping::default(),
            limit_tolerance: DEFAULT_LIMIT_TOLERANCE,
            limit_warn_every: DEFAULT_WARN_EVERY,
        }
    }
}

impl SafetyConfig {
    /// Check table lengths and value ranges.
    pub fn validate(&self) -> Result<(), TeleopError> {
        joint_table::<JointLimit, NUM_JOINTS>("joint_limits", &self.joint_limits)?;
        let cutoff = joint_table::<f64, NUM_JOINTS>("cutoff_hz", &self.cutoff_hz)?;
        let deadband = joint_table::<f64, NUM_JOINTS>("deadband", &self.deadband)?;
        let gear = joint_table::<f64, NUM_JOINTS>("gear_ratio", &self.gear_ratio)?;
        let sign = joint_table::<f64, NUM_JOINTS>("joint_sign", &self.joint_sign)?;
        let offset = joint_table::<f64, NUM_JOINTS>("follower_offset", &self.follower_offset)?;

        for i in 0..NUM_JOINTS {
            if !(cutoff[i].is_finite() && cutoff[i] > 0.0) {
                return Err(TeleopError::config(format!(
                    "joint {} cutoff must be positive, got {}",
                    i, cutoff[i]
                )));
            }
            if !(deadband[i].is_finite() && deadband[i] >= 0.0) {
                return Err(TeleopError::config(format!(
                    "joint {} dead-band must be non-negative",
                    i
                )));
            }
            if !gear[i].is_finite() {
                return Err(TeleopError::config(format!("joint {} gear ratio", i)));
            }
            if sign[i] != 1.0 && sign[i] != -1.0 {
                return Err(TeleopError::config(format!(
                    "joint {} sign must be +1 or -1, got {}",
                    i, sign[i]
                )));
            }
            if !offset[i].is_finite() {
                return Err(TeleopError::config(format!("joint {} offset", i)));
            }
        }
        if let Some(&j) = self.auto_zero_joints.iter().find(|&&j| j >= NUM_JOINTS) {
            return Err(TeleopError::config(format!("auto-zero joint {} out of range", j)));
        }
        if !(self.angular_scale.is_finite() && self.angular_scale != 0.0) {
            return Err(TeleopError::config("angular_scale must be finite and non-zero"));
        }
        if !(self.transition_time_s.is_finite() && self.transition_time_s >= 0.0) {
            return Err(TeleopError::config("transition_time_s must be non-negative"));
        }
        if self.gripper.min > self.gripper.max || !self.gripper.scale.is_finite() {
            return Err(TeleopError::config("gripper range"));
        }
        Ok(())
    }
}

/// Feetech leader arm connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    /// Serial device.
    pub port: String,
    /// Baud rate.
    pub baudrate: u32,
    /// Servo IDs of joints 0..5.
    pub motor_ids: Vec<u8>,
    /// Servo ID of the gripper.
    pub gripper_id: u8,
    /// Calibration file written by `feetech-calibrate`.
    pub calibration: Option<PathBuf>,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baudrate: 1_000_000,
            motor_ids: vec![1, 2, 3, 4, 5, 6],
            gripper_id: 7,
            calibration: None,
        }
    }
}

/// Follower arm behaviour.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowerConfig {
    /// Largest per-command joint step (radians) the follower accepts.
    pub max_relative_target: Option<f64>,
    /// Gripper command when fully open.
    pub gripper_open: f64,
    /// Gripper command when fully closed.
    pub gripper_close: f64,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            max_relative_target: None,
            gripper_open: 1000.0,
            gripper_close: 0.0,
        }
    }
}

/// Parking pose used by return-to-start ramps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParkConfig {
    /// Joint targets (radians).
    pub joints: Vec<f64>,
    /// Gripper target.
    pub gripper: f64,
    /// Ramp duration (seconds).
    pub return_time_s: f64,
}

impl Default for ParkConfig {
    fn default() -> Self {
        Self {
            joints: vec![FRAC_PI_2, 0.0, 0.0, 0.0, 0.0, 0.0],
            gripper: 0.0,
            return_time_s: 3.0,
        }
    }
}

impl ParkConfig {
    /// The parking pose as a command.
    pub fn pose(&self) -> Result<ArmCommand, TeleopError> {
        Ok(ArmCommand::new(
            joint_table("park.joints", &self.joints)?,
            self.gripper,
        ))
    }
}

/// Multi-episode recording settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Maximum number of episodes.
    pub num_episodes: u32,
    /// Maximum length of one episode (seconds).
    pub episode_time_s: f64,
    /// Task description stored with every episode.
    pub task: String,
    /// Dataset output directory.
    pub output_dir: PathBuf,
    /// Directory polled for control flag files.
    pub control_dir: PathBuf,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            num_episodes: 10,
            episode_time_s: 300.0,
            task: "ARX-X5 safe teleoperation".to_string(),
            output_dir: PathBuf::from("./data"),
            control_dir: PathBuf::from("/tmp/arx_teleop_control"),
        }
    }
}

impl RecordingConfig {
    /// Episode length as a [`Duration`]; must be finite and positive.
    pub fn episode_duration(&self) -> Result<Duration, TeleopError> {
        if !(self.episode_time_s.is_finite() && self.episode_time_s > 0.0) {
            return Err(TeleopError::config(format!(
                "recording.episode_time_s must be positive, got {}",
                self.episode_time_s
            )));
        }
        Duration::try_from_secs_f64(self.episode_time_s).map_err(|e| {
            TeleopError::config(format!(
                "recording.episode_time_s {} is out of range: {}",
                self.episode_time_s, e
            ))
        })
    }
}

/// One camera recorded alongside the arm state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Name used as the frame key in recordings.
    pub name: String,
    /// V4L2 device path.
    pub device: String,
    /// Requested width.
    pub width: u32,
    /// Requested height.
    pub height: u32,
    /// Requested frame rate.
    pub fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: "front".to_string(),
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeleopConfig {
    /// Control loop rate (Hz); also the filter sample rate.
    pub rate_hz: f64,
    /// Mapping pipeline.
    pub safety: SafetyConfig,
    /// Leader connection.
    pub leader: LeaderConfig,
    /// Follower behaviour.
    pub follower: FollowerConfig,
    /// Parking pose.
    pub park: ParkConfig,
    /// Recording session.
    pub recording: RecordingConfig,
    /// Cameras sampled every tick; empty for none.
    pub cameras: Vec<CameraConfig>,
}

impl Default for TeleopConfig {
    fn default() -> Self {
        Self {
            rate_hz: 30.0,
            safety: SafetyConfig::default(),
            leader: LeaderConfig::default(),
            follower: FollowerConfig::default(),
            park: ParkConfig::default(),
            recording: RecordingConfig::default(),
            cameras: Vec::new(),
        }
    }
}

impl TeleopConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: TeleopConfig = serde_json::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section.
    pub fn validate(&self) -> Result<(), TeleopError> {
        if !(self.rate_hz.is_finite() && self.rate_hz > 0.0) {
            return Err(TeleopError::config("rate_hz must be positive"));
        }
        self.safety.validate()?;
        self.park.pose()?;
        if !(self.park.return_time_s.is_finite() && self.park.return_time_s >= 0.0) {
            return Err(TeleopError::config("park.return_time_s must be non-negative"));
        }
        self.recording.episode_duration()?;
        if self.leader.motor_ids.len() != NUM_JOINTS {
            return Err(TeleopError::LengthMismatch {
                what: "leader.motor_ids",
                expected: NUM_JOINTS,
                actual: self.leader.motor_ids.len(),
            });
        }
        if let Some(max) = self.follower.max_relative_target {
            if !(max.is_finite() && max > 0.0) {
                return Err(TeleopError::config("max_relative_target must be positive"));
            }
        }
        for camera in &self.cameras {
            if camera.width == 0 || camera.height == 0 {
                return Err(TeleopError::config(format!(
                    "camera {} has an empty resolution",
                    camera.name
                )));
            }
        }
        if self.follower.gripper_close > self.follower.gripper_open {
            return Err(TeleopError::config("follower gripper close exceeds open"));
        }
        Ok(())
    }
}
