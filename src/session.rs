//! Multi-episode recording.
//!
//! A session first brings the follower to its working pose without recording,
//! then records up to `num_episodes` episodes. Between episodes the follower
//! returns to the parking pose and holds it until the operator asks for the
//! next episode; the mapper is then re-zeroed against wherever the leader is,
//! without a second offset ramp.

use crate::bus::{FollowerArm, LeaderArm};
use crate::config::RecordingConfig;
use crate::control::{ControlLoop, StopCondition, StopReason, TickOutput};
use crate::recording::{RecordedFrame, RecordingSink};
use crate::signals::{ControlEvents, ControlSignal};
use anyhow::Result;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// Every configured episode was recorded.
    Completed,
    /// Exit was requested through the control channel.
    Exit,
    /// The cancellation token fired.
    Cancelled,
}

/// Outcome of [`RecordingSession::run`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    /// Episodes saved during this session.
    pub episodes: u32,
    /// Frames written across those episodes.
    pub frames: u64,
    /// Why the session ended.
    pub end: SessionEnd,
}

enum Between {
    Next,
    Exit,
    Cancelled,
}

/// Drives a [`ControlLoop`] through a recording session into a [`RecordingSink`].
pub struct RecordingSession<'a, L, F, S> {
    control: &'a mut ControlLoop<L, F>,
    sink: S,
    events: ControlEvents,
    cancel: CancellationToken,
    config: RecordingConfig,
}

impl<'a, L: LeaderArm, F: FollowerArm, S: RecordingSink> RecordingSession<'a, L, F, S> {
    /// Create a session over a connected control loop.
    pub fn new(
        control: &'a mut ControlLoop<L, F>,
        sink: S,
        events: ControlEvents,
        cancel: CancellationToken,
        config: RecordingConfig,
    ) -> Self {
        Self {
            control,
            sink,
            events,
            cancel,
            config,
        }
    }

    /// Run the whole session and finalize the sink.
    ///
    /// On error the episode in progress is discarded, the sink is finalized
    /// best-effort and the error is returned; the control loop has already
    /// attempted to park the follower.
    pub fn run(&mut self) -> Result<SessionSummary> {
        match self.record_all() {
            Ok(summary) => {
                self.sink.finalize()?;
                tracing::info!(
                    "Recording finished: {} episodes, {} frames ({:?})",
                    summary.episodes,
                    summary.frames,
                    summary.end
                );
                Ok(summary)
            }
            Err(e) => {
                if let Err(discard) = self.sink.discard_episode() {
                    tracing::warn!("Discarding episode failed: {:#}", discard);
                }
                if let Err(finalize) = self.sink.finalize() {
                    tracing::warn!("Finalizing recording failed: {:#}", finalize);
                }
                Err(e)
            }
        }
    }

    /// The sink, e.g. to inspect what was recorded.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Consume the session, returning the sink.
    pub fn into_sink(self) -> S {
        self.sink
    }

    fn interrupt(&self) -> StopCondition {
        StopCondition::new()
            .with_cancel(self.cancel.clone())
            .with_events(self.events.clone())
    }

    fn record_all(&mut self) -> Result<SessionSummary> {
        let mut summary = SessionSummary {
            episodes: 0,
            frames: 0,
            end: SessionEnd::Completed,
        };
        // Rejected before the follower moves.
        let episode_time = self.config.episode_duration()?;

        // Only cancel and exit may interrupt pre-positioning.
        let preposition_stop = StopCondition::new()
            .with_cancel(self.cancel.clone())
            .with_exit_events(self.events.clone());
        let run = self.control.preposition(&preposition_stop)?;
        self.events.clear_transient();
        match run.reason {
            StopReason::Cancelled => {
                summary.end = SessionEnd::Cancelled;
                return Ok(summary);
            }
            StopReason::Exit => {
                summary.end = SessionEnd::Exit;
                return Ok(summary);
            }
            _ => {}
        }

        let first_index = self.sink.episodes_saved() as u32;
        for n in 0..self.config.num_episodes {
            if n > 0 {
                self.control.mapper_mut().reset_for_new_episode();
            }
            let episode = first_index + n;
            tracing::info!(
                "Recording episode {} ({}/{})",
                episode,
                n + 1,
                self.config.num_episodes
            );

            let (reason, frames) = self.record_episode(episode, episode_time)?;
            match reason {
                StopReason::Cancelled => {
                    self.sink.discard_episode()?;
                    summary.end = SessionEnd::Cancelled;
                    return Ok(summary);
                }
                _ => {
                    let saved = self.sink.save_episode()?;
                    debug_assert_eq!(saved, frames);
                    summary.episodes += 1;
                    summary.frames += saved;
                }
            }
            if reason == StopReason::Exit {
                summary.end = SessionEnd::Exit;
                return Ok(summary);
            }

            if n + 1 < self.config.num_episodes {
                match self.wait_for_next()? {
                    Between::Next => {}
                    Between::Exit => {
                        summary.end = SessionEnd::Exit;
                        return Ok(summary);
                    }
                    Between::Cancelled => {
                        summary.end = SessionEnd::Cancelled;
                        return Ok(summary);
                    }
                }
            }
        }
        Ok(summary)
    }

    fn record_episode(
        &mut self,
        episode: u32,
        episode_time: Duration,
    ) -> Result<(StopReason, u64)> {
        self.sink.start_episode(episode, &self.config.task)?;
        let stop = self.interrupt().with_max_duration(episode_time);

        let started = Instant::now();
        let mut index = 0u64;
        let sink = &mut self.sink;
        let run = self.control.run(&stop, |out: &TickOutput| {
            sink.add_frame(&RecordedFrame {
                episode,
                index,
                timestamp_s: started.elapsed().as_secs_f64(),
                observation: out.follower,
                leader: out.leader,
                action: out.command,
                images: out.images.clone(),
            })?;
            index += 1;
            Ok(())
        })?;
        Ok((run.reason, index))
    }

    fn wait_for_next(&mut self) -> Result<Between> {
        self.control.return_to_start()?;
        let park = *self.control.park_pose();
        tracing::info!("Parked; waiting for next episode or exit");

        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let decision = self.control.hold_pose_until(&park, || {
            if cancel.is_cancelled() {
                Some(Between::Cancelled)
            } else if events.exit_requested() {
                Some(Between::Exit)
            } else if events.take(ControlSignal::NextEpisode) {
                Some(Between::Next)
            } else {
                None
            }
        })?;
        self.events.clear_transient();
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FollowerConfig, TeleopConfig};
    use crate::recording::MemorySink;
    use crate::sim::{SimFollower, SimLeader};
    use crate::types::ArmState;
    use std::f64::consts::FRAC_PI_2;

    fn config() -> TeleopConfig {
        let mut config = TeleopConfig::default();
        config.rate_hz = 500.0;
        config.safety.settle_ticks = 2;
        config.safety.follower_offset = vec![FRAC_PI_2, 0.0, 0.0, 0.0, 0.0, 0.0];
        config.safety.transition_time_s = 0.01;
        config.park.return_time_s = 0.01;
        config.recording.num_episodes = 2;
        config.recording.episode_time_s = 0.02;
        config
    }

    fn rig(config: &TeleopConfig) -> (SimLeader, SimFollower, ControlLoop<SimLeader, SimFollower>) {
        let leader = SimLeader::new(ArmState::new([0.0; 6], 20.0));
        let follower = SimFollower::new(
            ArmState::new([0.0, 0.3, 0.3, 0.0, 0.0, 0.0], 0.0),
            FollowerConfig::default(),
        );
        let mut control = ControlLoop::new(leader.clone(), follower.clone(), config).unwrap();
        control.connect().unwrap();
        (leader, follower, control)
    }

    #[test]
    fn test_two_episodes_with_next_signal() {
        let config = config();
        let (_leader, _follower, mut control) = rig(&config);
        let events = ControlEvents::new();
        let next_events = events.clone();
        let cancel = CancellationToken::new();

        let mut session = RecordingSession::new(
            &mut control,
            MemorySink::new(),
            events,
            cancel,
            config.recording.clone(),
        );
        let feeder = std::thread::spawn(move || {
            for _ in 0..500 {
                next_events.raise(ControlSignal::NextEpisode);
                std::thread::sleep(Duration::from_millis(2));
            }
        });
        let summary = session.run().unwrap();
        let sink = session.into_sink();
        feeder.join().unwrap();

        assert_eq!(summary.end, SessionEnd::Completed);
        assert_eq!(summary.episodes, 2);
        assert_eq!(sink.episodes.len(), 2);
        assert!(sink.finalized);
        for (n, episode) in sink.episodes.iter().enumerate() {
            assert!(!episode.is_empty());
            assert!(episode.iter().all(|f| f.episode == n as u32));
            assert_eq!(episode[0].index, 0);
        }

        // Second episode starts from the parking pose and holds it: the mapper
        // was re-zeroed without another offset ramp.
        let second = &sink.episodes[1];
        assert!(!control.mapper().in_transition());
        assert_eq!(second[0].action.joints, control.park_pose().joints);
        assert!(second
            .iter()
            .all(|f| (f.action.joints[0] - FRAC_PI_2).abs() < 1e-9));
    }

    #[test]
    fn test_exit_during_episode_saves_and_stops() {
        let mut config = config();
        config.recording.episode_time_s = 60.0;
        let (_leader, _follower, mut control) = rig(&config);
        let events = ControlEvents::new();
        let trigger = events.clone();
        let mut session = RecordingSession::new(
            &mut control,
            MemorySink::new(),
            events,
            CancellationToken::new(),
            config.recording.clone(),
        );
        let feeder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.raise(ControlSignal::Exit);
        });
        let summary = session.run().unwrap();
        feeder.join().unwrap();
        assert_eq!(summary.end, SessionEnd::Exit);
        assert_eq!(summary.episodes, 1);
        assert_eq!(session.sink().episodes.len(), 1);
    }

    #[test]
    fn test_cancel_while_parked() {
        let config = config();
        let (_leader, follower, mut control) = rig(&config);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut session = RecordingSession::new(
            &mut control,
            MemorySink::new(),
            ControlEvents::new(),
            cancel,
            config.recording.clone(),
        );
        let feeder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            token.cancel();
        });
        let summary = session.run().unwrap();
        feeder.join().unwrap();
        assert_eq!(summary.end, SessionEnd::Cancelled);
        assert_eq!(summary.episodes, 1);
        let park = *control.park_pose();
        assert_eq!(follower.present().joints, park.joints);
    }

    #[test]
    fn test_bus_error_discards_episode() {
        let mut config = config();
        config.recording.episode_time_s = 60.0;
        let (leader, follower, mut control) = rig(&config);
        leader.fail_after(40);
        let mut session = RecordingSession::new(
            &mut control,
            MemorySink::new(),
            ControlEvents::new(),
            CancellationToken::new(),
            config.recording.clone(),
        );
        assert!(session.run().is_err());
        let sink = session.into_sink();
        assert!(sink.episodes.is_empty());
        assert_eq!(sink.discarded, 1);
        assert!(sink.finalized);
        let park = *control.park_pose();
        assert_eq!(follower.present().joints, park.joints);
    }

    #[test]
    fn test_invalid_episode_time_fails_before_moving() {
        let config = config();
        let (_leader, follower, mut control) = rig(&config);
        let mut recording = config.recording.clone();
        recording.episode_time_s = -1.0;
        let mut session = RecordingSession::new(
            &mut control,
            MemorySink::new(),
            ControlEvents::new(),
            CancellationToken::new(),
            recording,
        );
        let err = session.run().unwrap_err();
        assert!(err.to_string().contains("episode_time_s"));
        assert!(follower.commands().is_empty());
        let sink = session.into_sink();
        assert!(sink.episodes.is_empty());
        assert!(sink.finalized);
    }
}
