//! In-process simulated arms.
//!
//! Used by the test suite and the binaries' `--sim` mode. The follower tracks
//! every command perfectly; both arms can be told to fail after a number of
//! calls to exercise error paths. State lives behind an `Arc<Mutex<_>>` so a
//! handle can inspect or steer the arm after it has moved into a control loop.

use crate::bus::{clamp_relative, FollowerArm, LeaderArm};
use crate::config::FollowerConfig;
use crate::error::TeleopError;
use crate::types::{ArmCommand, ArmState, Observation};
use anyhow::{bail, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned sim state is still usable; the panic is reported by the test.
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Default)]
struct LeaderState {
    connected: bool,
    pose: ArmState,
    script: VecDeque<ArmState>,
    reads: usize,
    fail_after: Option<usize>,
}

/// Simulated leader arm.
///
/// Reports a fixed pose, or replays a script one pose per read and then keeps
/// reporting the last scripted pose.
#[derive(Clone, Debug, Default)]
pub struct SimLeader {
    state: Arc<Mutex<LeaderState>>,
}

impl SimLeader {
    /// Leader resting at `pose`.
    pub fn new(pose: ArmState) -> Self {
        Self {
            state: Arc::new(Mutex::new(LeaderState {
                pose,
                ..LeaderState::default()
            })),
        }
    }

    /// Leader replaying `poses` in order.
    pub fn scripted(poses: impl IntoIterator<Item = ArmState>) -> Self {
        let leader = Self::default();
        lock(&leader.state).script = poses.into_iter().collect();
        leader
    }

    /// Move the leader.
    pub fn set_pose(&self, pose: ArmState) {
        let mut state = lock(&self.state);
        state.script.clear();
        state.pose = pose;
    }

    /// Make every read after the first `reads` fail.
    pub fn fail_after(&self, reads: usize) {
        lock(&self.state).fail_after = Some(reads);
    }

    /// Number of successful reads.
    pub fn reads(&self) -> usize {
        lock(&self.state).reads
    }
}

impl LeaderArm for SimLeader {
    fn connect(&mut self) -> Result<()> {
        lock(&self.state).connected = true;
        tracing::info!("Simulated leader connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn read(&mut self) -> Result<Observation> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(TeleopError::NotConnected("leader").into());
        }
        if state.fail_after.is_some_and(|n| state.reads >= n) {
            bail!("simulated leader read failure after {} reads", state.reads);
        }
        if let Some(next) = state.script.pop_front() {
            state.pose = next;
        }
        state.reads += 1;
        Ok(state.pose.to_observation())
    }

    fn disconnect(&mut self) -> Result<()> {
        lock(&self.state).connected = false;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FollowerState {
    connected: bool,
    present: ArmState,
    commands: Vec<ArmCommand>,
    fail_sends_after: Option<usize>,
    disconnects: usize,
}

/// Simulated follower arm that moves exactly to each applied command.
#[derive(Clone, Debug)]
pub struct SimFollower {
    state: Arc<Mutex<FollowerState>>,
    config: FollowerConfig,
}

impl SimFollower {
    /// Follower powered up at `present`.
    pub fn new(present: ArmState, config: FollowerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(FollowerState {
                present,
                ..FollowerState::default()
            })),
            config,
        }
    }

    /// Current pose.
    pub fn present(&self) -> ArmState {
        lock(&self.state).present
    }

    /// Teleport the arm, e.g. to emulate an external disturbance.
    pub fn set_present(&self, present: ArmState) {
        lock(&self.state).present = present;
    }

    /// Every command applied so far.
    pub fn commands(&self) -> Vec<ArmCommand> {
        lock(&self.state).commands.clone()
    }

    /// Make every send after the first `sends` fail.
    pub fn fail_sends_after(&self, sends: usize) {
        lock(&self.state).fail_sends_after = Some(sends);
    }

    /// Let sends succeed again.
    pub fn clear_fault(&self) {
        lock(&self.state).fail_sends_after = None;
    }

    /// Number of times the follower was disconnected.
    pub fn disconnects(&self) -> usize {
        lock(&self.state).disconnects
    }
}

impl FollowerArm for SimFollower {
    fn connect(&mut self) -> Result<()> {
        lock(&self.state).connected = true;
        tracing::info!("Simulated follower connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn read(&mut self) -> Result<Observation> {
        let state = lock(&self.state);
        if !state.connected {
            return Err(TeleopError::NotConnected("follower").into());
        }
        Ok(state.present.to_observation())
    }

    fn send(&mut self, command: &ArmCommand) -> Result<ArmCommand> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(TeleopError::NotConnected("follower").into());
        }
        if state
            .fail_sends_after
            .is_some_and(|n| state.commands.len() >= n)
        {
            bail!(
                "simulated follower send failure after {} commands",
                state.commands.len()
            );
        }

        let mut applied = match self.config.max_relative_target {
            Some(max) => clamp_relative(command, &state.present, max),
            None => *command,
        };
        applied.gripper = applied
            .gripper
            .clamp(self.config.gripper_close, self.config.gripper_open);

        state.present = applied;
        state.commands.push(applied);
        Ok(applied)
    }

    fn disconnect(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.connected = false;
        state.disconnects += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leader_replays_script_then_holds_last() {
        let mut leader = SimLeader::scripted([
            ArmState::new([1.0; 6], 0.0),
            ArmState::new([2.0; 6], 0.0),
        ]);
        assert!(leader.read().is_err());
        leader.connect().unwrap();
        let poses: Vec<f64> = (0..4)
            .map(|_| ArmState::from_observation(&leader.read().unwrap()).unwrap().joints[0])
            .collect();
        assert_eq!(poses, vec![1.0, 2.0, 2.0, 2.0]);
        assert_eq!(leader.reads(), 4);
    }

    #[test]
    fn test_follower_applies_driver_clamps() {
        let config = FollowerConfig {
            max_relative_target: Some(0.2),
            ..FollowerConfig::default()
        };
        let mut follower = SimFollower::new(ArmState::default(), config);
        follower.connect().unwrap();
        let applied = follower
            .send(&ArmCommand::new([1.0, 0.1, 0.0, 0.0, 0.0, 0.0], 1500.0))
            .unwrap();
        assert_eq!(applied.joints[0], 0.2);
        assert_eq!(applied.joints[1], 0.1);
        assert_eq!(applied.gripper, 1000.0);
        assert_eq!(follower.present(), applied);
    }

    #[test]
    fn test_follower_fault_injection() {
        let mut follower = SimFollower::new(ArmState::default(), FollowerConfig::default());
        follower.connect().unwrap();
        follower.fail_sends_after(1);
        assert!(follower.send(&ArmCommand::default()).is_ok());
        assert!(follower.send(&ArmCommand::default()).is_err());
        follower.clear_fault();
        assert!(follower.send(&ArmCommand::default()).is_ok());
        assert_eq!(follower.commands().len(), 2);
    }
}
