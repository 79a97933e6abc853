//! Fixed-rate control loop.
//!
//! One tick is strictly: read leader, read follower, map, send to follower.
//! Stop requests are honoured at tick boundaries only, so no command is ever
//! left half-applied. Bus failures are never retried; the loop parks the
//! follower on a best-effort basis and reports the error.

use crate::bus::{FollowerArm, LeaderArm};
use crate::camera::{CameraFrame, CameraTap};
use crate::config::TeleopConfig;
use crate::mapper::SafeTeleopMapper;
use crate::ramp::ReturnRamp;
use crate::signals::{ControlEvents, ControlSignal};
use crate::types::{ArmCommand, ArmState};
use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Log a slow tick at most once per this many overruns.
const OVERRUN_REPORT_EVERY: u64 = 30;

/// Fixed tick period with overrun accounting.
///
/// A late tick is absorbed: the next one starts immediately, and no extra
/// ticks are run to catch up.
#[derive(Clone, Debug)]
pub struct Rate {
    period: Duration,
    overruns: u64,
}

impl Rate {
    /// Rate of `hz` ticks per second.
    pub fn new(hz: f64) -> Self {
        Self {
            period: Duration::from_secs_f64(1.0 / hz),
            overruns: 0,
        }
    }

    /// Tick period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Sleep out the rest of the period that began at `tick_start`.
    /// Returns the time slept.
    pub fn sleep_remaining(&mut self, tick_start: Instant) -> Duration {
        let elapsed = tick_start.elapsed();
        match self.period.checked_sub(elapsed) {
            Some(remaining) if !remaining.is_zero() => {
                std::thread::sleep(remaining);
                remaining
            }
            _ => {
                self.overruns += 1;
                if self.overruns % OVERRUN_REPORT_EVERY == 1 {
                    tracing::warn!(
                        "Control tick took {:.1}ms (budget {:.1}ms), {} overruns so far",
                        elapsed.as_secs_f64() * 1000.0,
                        self.period.as_secs_f64() * 1000.0,
                        self.overruns
                    );
                }
                Duration::ZERO
            }
        }
    }

    /// Ticks that exceeded their budget.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}

/// Why [`ControlLoop::run`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The cancellation token fired (Ctrl+C).
    Cancelled,
    /// Exit was requested through the control channel.
    Exit,
    /// Saving the current episode was requested.
    Save,
    /// The maximum duration elapsed.
    Timeout,
    /// The follower finished aligning and ramping to its offset pose.
    Settled,
}

/// Conditions checked at every tick boundary, in the order listed on
/// [`StopReason`].
#[derive(Clone, Debug, Default)]
pub struct StopCondition {
    cancel: Option<CancellationToken>,
    events: Option<ControlEvents>,
    stop_on_save: bool,
    max_duration: Option<Duration>,
}

impl StopCondition {
    /// Never stops on its own.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop when `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Stop on exit or save events. A save event is consumed.
    pub fn with_events(mut self, events: ControlEvents) -> Self {
        self.events = Some(events);
        self.stop_on_save = true;
        self
    }

    /// Stop on exit events only; save events are left pending.
    pub fn with_exit_events(mut self, events: ControlEvents) -> Self {
        self.events = Some(events);
        self.stop_on_save = false;
        self
    }

    /// Stop after `duration`.
    pub fn with_max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration);
        self
    }

    /// Evaluate against a run that started at `started`.
    pub fn check(&self, started: Instant) -> Option<StopReason> {
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Some(StopReason::Cancelled);
        }
        if let Some(events) = &self.events {
            if events.exit_requested() {
                return Some(StopReason::Exit);
            }
            if self.stop_on_save && events.take(ControlSignal::SaveEpisode) {
                return Some(StopReason::Save);
            }
        }
        if self.max_duration.is_some_and(|d| started.elapsed() >= d) {
            return Some(StopReason::Timeout);
        }
        None
    }
}

/// Everything one tick observed and did.
#[derive(Clone, Debug)]
pub struct TickOutput {
    /// Follower state read at the start of the tick.
    pub follower: ArmState,
    /// Leader state read this tick.
    pub leader: ArmState,
    /// Command applied to the follower.
    pub command: ArmCommand,
    /// Latest camera frames, sampled without waiting.
    pub images: Vec<CameraFrame>,
}

/// Result of a completed [`ControlLoop::run`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunSummary {
    /// Why the run ended.
    pub reason: StopReason,
    /// Ticks executed.
    pub ticks: u64,
    /// Wall-clock duration.
    pub elapsed: Duration,
}

/// Owns both arm connections and the mapper for the lifetime of a session.
pub struct ControlLoop<L, F> {
    leader: L,
    follower: F,
    mapper: SafeTeleopMapper,
    cameras: Vec<CameraTap>,
    rate: Rate,
    rate_hz: f64,
    park: ArmCommand,
    return_time_s: f64,
    ticks: u64,
}

impl<L: LeaderArm, F: FollowerArm> ControlLoop<L, F> {
    /// Build a loop from a validated configuration.
    pub fn new(leader: L, follower: F, config: &TeleopConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            leader,
            follower,
            mapper: SafeTeleopMapper::new(&config.safety, config.rate_hz)?,
            cameras: Vec::new(),
            rate: Rate::new(config.rate_hz),
            rate_hz: config.rate_hz,
            park: config.park.pose()?,
            return_time_s: config.park.return_time_s,
            ticks: 0,
        })
    }

    /// Sample these cameras every tick.
    pub fn with_cameras(mut self, cameras: Vec<CameraTap>) -> Self {
        self.cameras = cameras;
        self
    }

    /// Connect both arms and compute auto-zero offsets from the follower's
    /// power-on pose.
    pub fn connect(&mut self) -> Result<()> {
        self.leader.connect().context("connecting leader")?;
        self.follower.connect().context("connecting follower")?;
        let present = self.read_follower()?;
        tracing::info!(
            "Follower at {} on connect",
            crate::types::fmt_degrees(&present.joints)
        );
        self.mapper.compensate_offsets(&present);
        Ok(())
    }

    fn read_follower(&mut self) -> Result<ArmState> {
        let obs = self.follower.read().context("reading follower")?;
        Ok(ArmState::from_observation(&obs)?)
    }

    /// Run one control tick.
    pub fn tick(&mut self) -> Result<TickOutput> {
        let leader_obs = self.leader.read().context("reading leader")?;
        let follower_obs = self.follower.read().context("reading follower")?;
        let leader = ArmState::from_observation(&leader_obs)?;
        let follower = ArmState::from_observation(&follower_obs)?;

        let target = self.mapper.step_state(&leader, &follower);
        let command = self.follower.send(&target).context("sending follower command")?;
        self.ticks += 1;

        Ok(TickOutput {
            follower,
            leader,
            command,
            images: self.cameras.iter().filter_map(CameraTap::latest).collect(),
        })
    }

    /// Tick at the configured rate until `stop` fires, handing every tick to
    /// `on_tick`.
    ///
    /// On any error the follower is parked best-effort before the error is
    /// returned.
    pub fn run<S>(&mut self, stop: &StopCondition, on_tick: S) -> Result<RunSummary>
    where
        S: FnMut(&TickOutput) -> Result<()>,
    {
        self.drive(stop, on_tick, false)
    }

    /// Tick without a consumer until the mapper is aligned and any offset
    /// ramp has finished, or until `stop` fires.
    pub fn preposition(&mut self, stop: &StopCondition) -> Result<RunSummary> {
        tracing::info!("Pre-positioning follower");
        self.drive(stop, |_| Ok(()), true)
    }

    fn drive<S>(
        &mut self,
        stop: &StopCondition,
        mut on_tick: S,
        until_settled: bool,
    ) -> Result<RunSummary>
    where
        S: FnMut(&TickOutput) -> Result<()>,
    {
        let started = Instant::now();
        let mut ticks = 0u64;
        loop {
            let settled =
                until_settled && self.mapper.is_aligned() && !self.mapper.in_transition();
            let reason = if settled {
                Some(StopReason::Settled)
            } else {
                stop.check(started)
            };
            if let Some(reason) = reason {
                tracing::info!("Control loop stopping: {:?} after {} ticks", reason, ticks);
                return Ok(RunSummary {
                    reason,
                    ticks,
                    elapsed: started.elapsed(),
                });
            }

            let tick_start = Instant::now();
            let result = self.tick().and_then(|out| on_tick(&out));
            if let Err(e) = result {
                tracing::error!("Control loop failed: {:#}", e);
                self.park_best_effort();
                return Err(e);
            }
            ticks += 1;
            self.rate.sleep_remaining(tick_start);
        }
    }

    /// Ramp the follower from where it is to the parking pose.
    pub fn return_to_start(&mut self) -> Result<()> {
        let start = self.read_follower()?;
        let ramp = ReturnRamp::new(start, self.park, self.return_time_s, self.rate_hz);
        tracing::info!(
            "Returning to parking pose {} over {} steps",
            crate::types::fmt_degrees(&self.park.joints),
            ramp.steps()
        );
        for command in ramp {
            let tick_start = Instant::now();
            self.follower
                .send(&command)
                .context("sending parking command")?;
            self.rate.sleep_remaining(tick_start);
        }
        Ok(())
    }

    /// Park, logging instead of returning any failure.
    pub fn park_best_effort(&mut self) {
        if let Err(e) = self.return_to_start() {
            tracing::warn!("Return to parking pose failed: {:#}", e);
        }
    }

    /// Re-send `pose` every tick until `done` returns a reason to stop.
    ///
    /// Keeps the follower's command watchdog fed while waiting for the operator.
    pub fn hold_pose_until<T>(
        &mut self,
        pose: &ArmCommand,
        mut done: impl FnMut() -> Option<T>,
    ) -> Result<T> {
        loop {
            if let Some(value) = done() {
                return Ok(value);
            }
            let tick_start = Instant::now();
            self.follower.send(pose).context("holding pose")?;
            self.rate.sleep_remaining(tick_start);
        }
    }

    /// Park and disconnect both arms. Disconnect errors are logged.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.follower.is_connected() {
            self.park_best_effort();
            if let Err(e) = self.follower.disconnect() {
                tracing::warn!("Follower disconnect failed: {:#}", e);
            }
        }
        if self.leader.is_connected() {
            if let Err(e) = self.leader.disconnect() {
                tracing::warn!("Leader disconnect failed: {:#}", e);
            }
        }
        for camera in &mut self.cameras {
            camera.stop();
        }
        tracing::info!(
            "Shut down after {} ticks ({} overruns)",
            self.ticks,
            self.rate.overruns()
        );
        Ok(())
    }

    /// Parking pose.
    pub fn park_pose(&self) -> &ArmCommand {
        &self.park
    }

    /// Mapper state.
    pub fn mapper(&self) -> &SafeTeleopMapper {
        &self.mapper
    }

    /// Mutable mapper, e.g. for an episode reset.
    pub fn mapper_mut(&mut self) -> &mut SafeTeleopMapper {
        &mut self.mapper
    }

    /// Ticks executed over the loop's lifetime.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Tick timing.
    pub fn rate(&self) -> &Rate {
        &self.rate
    }

    /// Leader connection.
    pub fn leader(&self) -> &L {
        &self.leader
    }

    /// Follower connection.
    pub fn follower(&self) -> &F {
        &self.follower
    }
}
