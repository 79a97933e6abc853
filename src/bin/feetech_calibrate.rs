//! Calibration tool for the Feetech leader arm.
//!
//! ```sh
//! feetech-calibrate /dev/ttyACM0 1 2 3 4 5 6 7
//! feetech-calibrate /dev/ttyACM0 1 2 3 4 5 6 7 leader_calibration.json
//! ```
//!
//! Torque is disabled; move every joint and the gripper through their full
//! range. Positions are read continuously and each servo's min and max are
//! tracked. Press Enter when done. Output defaults to `leader_calibration.json`.

use anyhow::{bail, Context, Result};
use arx_teleop::calibration::RangeTracker;
use arx_teleop::feetech::{open_controller, set_torque};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BAUDRATE: u32 = 1_000_000;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("arx_teleop=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        println!("Usage: feetech-calibrate <device> <servo_id> [servo_id ...] [output.json]");
        println!("  e.g. feetech-calibrate /dev/ttyACM0 1 2 3 4 5 6 7");
        return Ok(());
    }

    let device = &args[1];
    let (id_args, output) = match args.last() {
        Some(last) if args.len() > 3 && last.ends_with(".json") => {
            (&args[2..args.len() - 1], last.as_str())
        }
        _ => (&args[2..], "leader_calibration.json"),
    };
    let ids = id_args
        .iter()
        .map(|s| s.parse::<u8>().with_context(|| format!("bad servo id {}", s)))
        .collect::<Result<Vec<u8>>>()?;
    if ids.is_empty() {
        bail!("at least one servo id is required");
    }

    let mut controller = open_controller(device, BAUDRATE)?;
    set_torque(&mut controller, &ids, false);

    println!("Calibrating {} servos on {}", ids.len(), device);
    println!("Move every joint and the gripper through its full range.");
    println!("Press Enter when done.");
    println!();

    let done = Arc::new(AtomicBool::new(false));
    let done_clone = done.clone();
    std::thread::spawn(move || {
        let mut buf = [0u8; 1];
        let _ = io::stdin().read(&mut buf);
        done_clone.store(true, Ordering::Relaxed);
    });

    let mut tracker = RangeTracker::new(&ids);
    let mut cycles = 0u64;
    while !done.load(Ordering::Relaxed) {
        match controller.sync_read_present_position(&ids) {
            Ok(positions) => tracker.observe(&positions),
            Err(e) => tracing::warn!("Read failed: {}", e),
        }
        cycles += 1;
        if cycles % 30 == 0 {
            print!("\r{}", tracker.summary());
            io::stdout().flush().ok();
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    println!();
    println!();

    let calibration = tracker.finish()?;
    calibration.save(Path::new(output))?;

    println!("Saved to {}:", output);
    for m in &calibration.motors {
        println!(
            "  servo {:>2}: min={:>7.3}  max={:>7.3}  center={:>7.3}  range={:>6.3}",
            m.id,
            m.min,
            m.max,
            m.center(),
            m.range()
        );
    }
    Ok(())
}
