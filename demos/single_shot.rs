// Single-shot capture example
//
// Freezes the continuous loop, arms a single capture on a falling or rising
// edge and waits for it to fire.

use clap::Parser;
use oscope_link::{LinkConfig, OscopeConnector, Phase, TriggerConfig};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "single_shot")]
#[command(version = "1.0")]
#[command(about = "Capture a single triggered buffer")]
struct Args {
    /// Serial port, discovered automatically when omitted
    #[arg(short, long)]
    port: Option<String>,

    /// Trigger voltage
    #[arg(short, long, default_value_t = 2.5)]
    volts: f64,

    /// Full scale voltage of the ADC reference
    #[arg(long, default_value_t = 5.0)]
    full_scale: f64,

    /// Trigger on the falling edge
    #[arg(long)]
    falling: bool,

    /// Give up after this many seconds
    #[arg(short, long, default_value_t = 10)]
    timeout: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    env_logger::init();

    let builder = TriggerConfig::start_capturing_when();
    let trigger = if args.falling {
        builder.falling_edge_volts(args.volts, args.full_scale)?
    } else {
        builder.rising_edge_volts(args.volts, args.full_scale)?
    };
    println!("Trigger: {}", trigger);

    let mut session = OscopeConnector::connect(args.port.as_deref(), (), LinkConfig::default())?;
    let deadline = Instant::now() + Duration::from_secs(args.timeout);

    while session.phase() != Phase::Sampling && Instant::now() < deadline {
        session.pump()?;
        session.poll(Instant::now())?;
    }
    session.apply_trigger(&trigger)?;
    session.set_freeze(true);

    let fired = Rc::new(Cell::new(false));
    let flag = Rc::clone(&fired);
    session.arm_oneshot(Some(Box::new(move || flag.set(true))))?;

    while !fired.get() && Instant::now() < deadline {
        if session.pump()? == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    if fired.get() {
        println!("Captured after {} frame(s)", session.stats().sample_frames);
    } else {
        println!("No trigger within {} s", args.timeout);
    }

    // Back to continuous capture for the next user of the device.
    session.arm_oneshot(None)?;
    session.set_freeze(false);
    Ok(())
}
