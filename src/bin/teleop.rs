//! Live teleoperation - drive the follower from the leader until Ctrl+C.
//!
//! Usage:
//!   teleop [OPTIONS]
//!
//! Options:
//!   --config <path>      JSON configuration (default: built-in ARX-X5 defaults)
//!   --sim                Use a simulated leader sweeping joint 0
//!   --duration <secs>    Stop after this many seconds
//!
//! Examples:
//!   teleop --config configs/arx_x5_record.json
//!   teleop --sim --duration 10

use anyhow::{Context, Result};
use arx_teleop::bus::LeaderArm;
use arx_teleop::config::TeleopConfig;
use arx_teleop::control::{ControlLoop, StopCondition};
use arx_teleop::sim::{SimFollower, SimLeader};
use arx_teleop::types::{fmt_degrees, ArmState, NUM_JOINTS};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Args {
    config: Option<PathBuf>,
    sim: bool,
    duration_secs: Option<f64>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut result = Args {
        config: None,
        sim: false,
        duration_secs: None,
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
            "--duration" if i + 1 < args.len() => {
                result.duration_secs = args[i + 1].parse().ok();
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
    println!("ARX-X5 teleoperation");
    println!();
    println!("Usage: teleop [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --config <path>      JSON configuration (default: built-in defaults)");
    println!("  --sim                Simulated leader sweeping joint 0");
    println!("  --duration <secs>    Stop after this many seconds");
}

/// A slow ±20 unit sweep of joint 0, one pose per tick.
fn sweep(rate_hz: f64, seconds: f64) -> Vec<ArmState> {
    let ticks = (rate_hz * seconds) as usize;
    (0..ticks)
        .map(|k| {
            let t = k as f64 / rate_hz;
            let mut joints = [0.0; NUM_JOINTS];
            // Still for the first two seconds so the zero is captured at rest.
            if t > 2.0 {
                joints[0] = 20.0 * (0.5 * (t - 2.0)).sin();
            }
            ArmState::new(joints, 50.0)
        })
        .collect()
}

fn make_leader(args: &Args, config: &TeleopConfig) -> Result<Box<dyn LeaderArm>> {
    if args.sim {
        let seconds = args.duration_secs.unwrap_or(60.0);
        return Ok(Box::new(SimLeader::scripted(sweep(config.rate_hz, seconds))));
    }
    #[cfg(feature = "serial")]
    {
        Ok(Box::new(arx_teleop::feetech::FeetechLeader::new(
            config.leader.clone(),
        )?))
    }
    #[cfg(not(feature = "serial"))]
    {
        anyhow::bail!("built without the `serial` feature; use --sim")
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("arx_teleop=info".parse()?)
                .add_directive("teleop=info".parse()?),
        )
        .init();

    let args = parse_args();
    let config = match &args.config {
        Some(path) => TeleopConfig::load(path)?,
        None => TeleopConfig::default(),
    };
    let max_duration = args
        .duration_secs
        .map(|secs| {
            Duration::try_from_secs_f64(secs).with_context(|| format!("invalid --duration {}", secs))
        })
        .transpose()?;

    let leader = make_leader(&args, &config)?;
    // No vendor follower driver is linked; the follower is simulated.
    let follower = SimFollower::new(ArmState::default(), config.follower.clone());
    tracing::warn!("Follower is simulated; commands are not sent to hardware");

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Ctrl+C received, stopping...");
        cancel_clone.cancel();
    })?;

    let mut stop = StopCondition::new().with_cancel(cancel);
    if let Some(duration) = max_duration {
        stop = stop.with_max_duration(duration);
    }

    println!("ARX-X5 teleoperation at {} Hz", config.rate_hz);
    println!("Press Ctrl+C to stop.");
    println!();

    let mut control = ControlLoop::new(leader, follower.clone(), &config)?;
    control.connect()?;
    let result = control.run(&stop, |out| {
        tracing::debug!("command {}", fmt_degrees(&out.command.joints));
        Ok(())
    });
    control.shutdown()?;

    let summary = result?;
    println!(
        "Teleoperation ended: {:?} after {} ticks ({:.1}s), follower at {}",
        summary.reason,
        summary.ticks,
        summary.elapsed.as_secs_f64(),
        fmt_degrees(&follower.present().joints)
    );
    Ok(())
}
