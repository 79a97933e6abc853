//! Arm bus abstraction.
//!
//! The control loop talks to the leader and follower only through these
//! traits, so the Feetech leader, a vendor follower driver and the simulated
//! arms in [`crate::sim`] are interchangeable.

use crate::types::{ArmCommand, ArmState, Observation};
use anyhow::Result;

/// The hand-moved input arm.
pub trait LeaderArm: Send {
    /// Open the bus. Must be called before [`read`](Self::read).
    fn connect(&mut self) -> Result<()>;

    /// Whether the bus is open.
    fn is_connected(&self) -> bool;

    /// Read joint and gripper positions as an observation.
    fn read(&mut self) -> Result<Observation>;

    /// Close the bus.
    fn disconnect(&mut self) -> Result<()>;
}

/// The commanded arm.
pub trait FollowerArm: Send {
    /// Open the bus and enable the motors.
    fn connect(&mut self) -> Result<()>;

    /// Whether the bus is open.
    fn is_connected(&self) -> bool;

    /// Read joint and gripper positions as an observation.
    fn read(&mut self) -> Result<Observation>;

    /// Send a position command, returning the command actually applied
    /// after any driver-side clamping.
    fn send(&mut self, command: &ArmCommand) -> Result<ArmCommand>;

    /// Disable the motors and close the bus.
    fn disconnect(&mut self) -> Result<()>;
}

impl<T: LeaderArm + ?Sized> LeaderArm for Box<T> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn read(&mut self) -> Result<Observation> {
        (**self).read()
    }

    fn disconnect(&mut self) -> Result<()> {
        (**self).disconnect()
    }
}

impl<T: FollowerArm + ?Sized> FollowerArm for Box<T> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn read(&mut self) -> Result<Observation> {
        (**self).read()
    }

    fn send(&mut self, command: &ArmCommand) -> Result<ArmCommand> {
        (**self).send(command)
    }

    fn disconnect(&mut self) -> Result<()> {
        (**self).disconnect()
    }
}

/// Limit each joint's step away from the present position to `max_step` radians.
///
/// The gripper is passed through untouched.
pub fn clamp_relative(target: &ArmCommand, present: &ArmState, max_step: f64) -> ArmCommand {
    let mut out = *target;
    for (i, (t, p)) in out.joints.iter_mut().zip(present.joints.iter()).enumerate() {
        let step = *t - p;
        if step.abs() > max_step {
            let safe = p + max_step.copysign(step);
            tracing::warn!(
                "Relative goal clipped on joint {}: {:.3} -> {:.3} rad",
                i,
                *t,
                safe
            );
            *t = safe;
        }
    }
    out
}
