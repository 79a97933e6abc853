//! Multi-episode recording with out-of-band control flags.
//!
//! Usage:
//!   record [OPTIONS]
//!
//! Options:
//!   --config <path>      JSON configuration (default: built-in defaults)
//!   --sim                Simulated leader and test-pattern cameras
//!   --episodes <n>       Override the number of episodes
//!   --output <dir>       Override the dataset directory
//!
//! While recording, touch files in the control directory (or run
//! `record-control`): `save_episode`, `next_episode`, `exit_recording`.

use anyhow::Result;
use arx_teleop::bus::LeaderArm;
use arx_teleop::camera::CameraTap;
use arx_teleop::config::TeleopConfig;
use arx_teleop::control::ControlLoop;
use arx_teleop::recording::JsonlSink;
use arx_teleop::session::RecordingSession;
use arx_teleop::signals::{ControlEvents, FileFlags, SignalWatcher, DEFAULT_POLL_INTERVAL};
use arx_teleop::sim::{SimFollower, SimLeader};
use arx_teleop::types::ArmState;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

struct Args {
    config: Option<PathBuf>,
    sim: bool,
    episodes: Option<u32>,
    output: Option<PathBuf>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut result = Args {
        config: None,
        sim: false,
        episodes: None,
        output: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                result.config = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--sim" => {
                result.sim = true;
                i += 1;
            }
            "--episodes" if i + 1 < args.len() => {
                result.episodes = args[i + 1].parse().ok();
                i += 2;
            }
            "--output" if i + 1 < args.len() => {
                result.output = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    result
}

fn print_usage() {
    println!("ARX-X5 episode recorder");
    println!();
    println!("Usage: record [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --config <path>      JSON configuration (default: built-in defaults)");
    println!("  --sim                Simulated leader and test-pattern cameras");
    println!("  --episodes <n>       Override the number of episodes");
    println!("  --output <dir>       Override the dataset directory");
}

fn make_leader(args: &Args, config: &TeleopConfig) -> Result<Box<dyn LeaderArm>> {
    if args.sim {
        return Ok(Box::new(SimLeader::new(ArmState::new([0.0; 6], 50.0))));
    }
    #[cfg(feature = "serial")]
    {
        Ok(Box::new(arx_teleop::feetech::FeetechLeader::new(
            config.leader.clone(),
        )?))
    }
    #[cfg(not(feature = "serial"))]
    {
        let _ = config;
        anyhow::bail!("built without the `serial` feature; use --sim")
    }
}

fn open_cameras(args: &Args, config: &TeleopConfig) -> Result<Vec<CameraTap>> {
    let mut taps = Vec::new();
    for camera in &config.cameras {
        if args.sim {
            let period = std::time::Duration::from_secs_f64(1.0 / camera.fps.max(1) as f64);
            taps.push(CameraTap::spawn(arx_teleop::camera::TestPattern::new(
                camera.name.clone(),
                camera.width,
                camera.height,
                period,
            )));
            continue;
        }
        #[cfg(feature = "camera")]
        {
            let source = arx_teleop::camera::V4lCamera::open(
                &camera.name,
                &camera.device,
                camera.width,
                camera.height,
            )?;
            taps.push(CameraTap::spawn(source));
        }
        #[cfg(not(feature = "camera"))]
        {
            tracing::warn!(
                "Camera {} skipped: built without the `camera` feature",
                camera.name
            );
        }
    }
    Ok(taps)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("arx_teleop=info".parse()?)
                .add_directive("record=info".parse()?),
        )
        .init();

    let args = parse_args();
    let mut config = match &args.config {
        Some(path) => TeleopConfig::load(path)?,
        None => TeleopConfig::default(),
    };
    if let Some(n) = args.episodes {
        config.recording.num_episodes = n;
    }
    if let Some(dir) = &args.output {
        config.recording.output_dir = dir.clone();
    }

    let flags = FileFlags::new(&config.recording.control_dir)?;
    flags.clear_stale()?;
    let events = ControlEvents::new();
    let mut watcher = SignalWatcher::spawn(flags.clone(), events.clone(), DEFAULT_POLL_INTERVAL);

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Ctrl+C received, stopping...");
        cancel_clone.cancel();
    })?;

    println!();
    println!("========================================");
    println!("ARX-X5 Recorder");
    println!("========================================");
    println!("Episodes:   {}", config.recording.num_episodes);
    println!("Length:     {}s", config.recording.episode_time_s);
    println!("Task:       {}", config.recording.task);
    println!("Output:     {}", config.recording.output_dir.display());
    println!("Control:    {}", flags.dir().display());
    println!("========================================");
    println!();

    let leader = make_leader(&args, &config)?;
    let follower = SimFollower::new(ArmState::default(), config.follower.clone());
    tracing::warn!("Follower is simulated; commands are not sent to hardware");

    let cameras = open_cameras(&args, &config)?;
    let mut control = ControlLoop::new(leader, follower, &config)?.with_cameras(cameras);
    let sink = JsonlSink::create(&config.recording.output_dir, config.rate_hz)?;

    let result = control.connect().and_then(|()| {
        let mut session = RecordingSession::new(
            &mut control,
            sink,
            events,
            cancel,
            config.recording.clone(),
        );
        session.run()
    });
    control.shutdown()?;
    watcher.stop();

    let summary = result?;
    println!(
        "Recorded {} episodes ({} frames), ended by {:?}",
        summary.episodes, summary.frames, summary.end
    );
    println!("Dataset: {}", config.recording.output_dir.display());
    Ok(())
}
