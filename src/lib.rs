//! arx-teleop - safe leader/follower teleoperation for ARX-X5 arms.
//!
//! A hand-moved Feetech leader arm drives an ARX-X5 follower. Every control
//! tick the leader reading is turned into a follower command that is
//! zero-aligned, filtered, dead-banded, offset-ramped and clamped to soft
//! joint limits before it reaches the motors. Recording sessions wrap the
//! same loop into episodes with parking between them.
//!
//! # Features
//!
//! - `serial`: Feetech STS3215 leader over a local serial port
//! - `image`: JPEG encoding of camera frames
//! - `camera`: V4L2 camera capture
//!
//! # Example
//!
//! ```no_run
//! use arx_teleop::config::TeleopConfig;
//! use arx_teleop::control::{ControlLoop, StopCondition};
//! use arx_teleop::sim::{SimFollower, SimLeader};
//! use arx_teleop::types::ArmState;
//! use std::time::Duration;
//!
//! let config = TeleopConfig::default();
//! let leader = SimLeader::new(ArmState::default());
//! let follower = SimFollower::new(ArmState::default(), config.follower.clone());
//! let mut control = ControlLoop::new(leader, follower, &config)?;
//! control.connect()?;
//! control.run(&StopCondition::new().with_max_duration(Duration::from_secs(5)), |_| Ok(()))?;
//! control.shutdown()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod alignment;
pub mod bus;
pub mod calibration;
pub mod camera;
pub mod config;
pub mod control;
pub mod error;
pub mod filter;
pub mod limits;
pub mod mapper;
pub mod ramp;
pub mod recording;
pub mod session;
pub mod signals;
pub mod sim;
pub mod types;

#[cfg(feature = "serial")]
pub mod feetech;

pub use bus::{FollowerArm, LeaderArm};
pub use config::TeleopConfig;
pub use control::ControlLoop;
pub use error::TeleopError;
pub use mapper::SafeTeleopMapper;
pub use types::{ArmCommand, ArmState, JointVector, Observation};

