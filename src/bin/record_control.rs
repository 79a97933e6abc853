//! Recording control - send save / next / exit requests to a running `record`.
//!
//! Usage:
//!   record-control [--dir <path>] [--config <path>]
//!
//! Commands (one per line):
//!   s   save the current episode
//!   n   start the next episode
//!   e   save and exit recording
//!   q   quit this program (recording continues)

use anyhow::Result;
use arx_teleop::config::TeleopConfig;
use arx_teleop::signals::{ControlSignal, FileFlags};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

struct Args {
    dir: Option<PathBuf>,
    config: Option<PathBuf>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut result = Args {
        dir: None,
        config: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--dir" if i + 1 < args.len() => {
                result.dir = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--config" if i + 1 < args.len() => {
                result.config = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--help" | "-h" => {
                print_menu();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    result
}

fn print_menu() {
    println!("Recording control");
    println!();
    println!("Usage: record-control [--dir <path>] [--config <path>]");
    println!();
    println!("Commands:");
    println!("  s - save the current episode");
    println!("  n - start the next episode");
    println!("  e - save and exit recording");
    println!("  q - quit this program (recording continues)");
}

fn command(input: &str) -> Option<Option<ControlSignal>> {
    match input {
        "s" => Some(Some(ControlSignal::SaveEpisode)),
        "n" => Some(Some(ControlSignal::NextEpisode)),
        "e" => Some(Some(ControlSignal::Exit)),
        "q" => Some(None),
        _ => None,
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("arx_teleop=info".parse()?),
        )
        .init();

    let args = parse_args();
    let dir = match (args.dir, args.config) {
        (Some(dir), _) => dir,
        (None, Some(config)) => TeleopConfig::load(config)?.recording.control_dir,
        (None, None) => TeleopConfig::default().recording.control_dir,
    };
    let flags = FileFlags::new(dir)?;

    print_menu();
    println!();
    println!("Control directory: {}", flags.dir().display());
    println!();

    let stdin = io::stdin();
    loop {
        print!("command [s/n/e/q]: ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        match command(line.trim().to_lowercase().as_str()) {
            Some(Some(signal)) => {
                flags.touch(signal)?;
                println!("sent {:?}", signal);
            }
            Some(None) => break,
            None => println!("unknown command"),
        }
        println!();
    }
    println!("Control program exited");
    Ok(())
}
