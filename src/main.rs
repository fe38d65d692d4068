use std::process::exit;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use servoscreen::{init_logging, ConnectionState, ConsoleSink, Monitor, MonitorConfig};

#[derive(Parser, Debug)]
#[command(
    name = "servoscreen",
    about = "Stream and display live data from a Servo-i ventilator"
)]
struct Args {
    /// Serial port the ventilator's CIE interface is attached to
    /// (e.g., /dev/ttyUSB0)
    port: String,
    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 5)]
    interval_ms: u64,
    /// Stop after this many seconds (runs until interrupted by default)
    #[arg(long)]
    duration_secs: Option<u64>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let config = MonitorConfig {
        poll_interval: Duration::from_millis(args.interval_ms),
        ..MonitorConfig::default()
    };
    let interval = config.poll_interval;

    let mut monitor = Monitor::new(ConsoleSink::new(), config);
    monitor
        .connect(&args.port)
        .with_context(|| format!("connecting to ventilator on {}", args.port))?;

    let deadline = args
        .duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    while monitor.state() == ConnectionState::Streaming {
        if let Err(e) = monitor.poll() {
            eprintln!("Acquisition stopped: {e}");
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        thread::sleep(interval);
    }

    monitor.disconnect();
    Ok(())
}
