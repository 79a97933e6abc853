//! Feetech STS3215 leader arm over a serial port.
//!
//! The leader is moved by hand, so torque is disabled on connect. Positions
//! are read with one sync-read per tick and normalized with the calibration
//! written by `feetech-calibrate`.

use crate::bus::LeaderArm;
use crate::calibration::{LeaderCalibration, MotorCalibration, NormMode};
use crate::config::LeaderConfig;
use crate::error::TeleopError;
use crate::types::{joint_key, Observation, GRIPPER_KEY, NUM_JOINTS};
use anyhow::{Context, Result};
use rustypot::servo::feetech::sts3215::Sts3215Controller;
use std::time::Duration;

/// Open a Feetech bus on `port`.
pub fn open_controller(port: &str, baudrate: u32) -> Result<Sts3215Controller> {
    let serial = serialport::new(port, baudrate)
        .timeout(Duration::from_millis(1000))
        .open()
        .with_context(|| format!("opening serial port {}", port))?;
    Ok(Sts3215Controller::new()
        .with_protocol_v1()
        .with_serial_port(serial))
}

/// Enable or disable torque on every servo, warning on individual failures.
pub fn set_torque(controller: &mut Sts3215Controller, ids: &[u8], enable: bool) {
    for &id in ids {
        if let Err(e) = controller.write_torque_enable(id, enable) {
            tracing::warn!("Failed to set torque={} on servo {}: {}", enable, id, e);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Hand-moved Feetech leader arm.
pub struct FeetechLeader {
    config: LeaderConfig,
    ids: Vec<u8>,
    calibration: Vec<MotorCalibration>,
    controller: Option<Sts3215Controller>,
}

impl FeetechLeader {
    /// Create a leader; the calibration file named in `config` is required.
    pub fn new(config: LeaderConfig) -> Result<Self> {
        let path = config
            .calibration
            .clone()
            .context("leader calibration file not configured; run feetech-calibrate")?;
        let calibration = LeaderCalibration::load(&path)?;
        Self::with_calibration(config, &calibration)
    }

    /// Create a leader from calibration data already in memory.
    pub fn with_calibration(config: LeaderConfig, calibration: &LeaderCalibration) -> Result<Self> {
        let mut ids = config.motor_ids.clone();
        if ids.len() != NUM_JOINTS {
            return Err(TeleopError::LengthMismatch {
                what: "leader.motor_ids",
                expected: NUM_JOINTS,
                actual: ids.len(),
            }
            .into());
        }
        ids.push(config.gripper_id);
        let calibration = calibration.for_ids(&ids)?;
        Ok(Self {
            config,
            ids,
            calibration,
            controller: None,
        })
    }
}

impl LeaderArm for FeetechLeader {
    fn connect(&mut self) -> Result<()> {
        let mut controller = open_controller(&self.config.port, self.config.baudrate)?;
        set_torque(&mut controller, &self.ids, false);
        tracing::info!(
            "Feetech leader on {} ready (torque disabled, servos {:?})",
            self.config.port,
            self.ids
        );
        self.controller = Some(controller);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.controller.is_some()
    }

    fn read(&mut self) -> Result<Observation> {
        let controller = self
            .controller
            .as_mut()
            .ok_or(TeleopError::NotConnected("leader"))?;
        let positions = controller
            .sync_read_present_position(&self.ids)
            .map_err(|e| anyhow::anyhow!("leader sync read failed: {}", e))?;
        if positions.len() != self.ids.len() {
            return Err(TeleopError::LengthMismatch {
                what: "leader positions",
                expected: self.ids.len(),
                actual: positions.len(),
            }
            .into());
        }

        let mut obs = Observation::new();
        for (i, (cal, pos)) in self.calibration.iter().zip(positions.iter()).enumerate() {
            if i < NUM_JOINTS {
                obs.insert(joint_key(i), cal.normalize(*pos, NormMode::RangeM100To100));
            } else {
                obs.insert(GRIPPER_KEY, cal.normalize(*pos, NormMode::Range0To100));
            }
        }
        Ok(obs)
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.controller.take().is_some() {
            tracing::info!("Feetech leader on {} disconnected", self.config.port);
        }
        Ok(())
    }
}
