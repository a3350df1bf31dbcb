// Basic device discovery and handshake example
//
// This example lists the serial bridges that look like an oscilloscope,
// connects to the first one and waits for the handshake to finish.

use oscope_link::{LinkConfig, OscopeConnector, Phase};
use std::time::{Duration, Instant};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (optional)
    env_logger::init();

    println!("Oscilloscope Discovery Example");
    println!("==============================\n");

    println!("1. Discovering available devices...");
    let devices = OscopeConnector::get_available_devices()?;

    if devices.is_empty() {
        println!("No oscilloscope found. Please connect a device and try again.");
        return Ok(());
    }

    println!("Found {} device(s):", devices.len());
    for (i, device) in devices.iter().enumerate() {
        println!("  {}. {} at {}", i + 1, device.name, device.port);
    }
    println!();

    println!("2. Connecting to first available device...");
    let mut session = OscopeConnector::connect(None, (), LinkConfig::default())?;

    println!("3. Waiting for handshake...");
    let deadline = Instant::now() + Duration::from_secs(10);
    while session.phase() != Phase::Sampling && Instant::now() < deadline {
        session.pump()?;
        session.poll(Instant::now())?;
    }

    if session.phase() != Phase::Sampling {
        println!("Handshake stalled in {:?}", session.phase());
        return Ok(());
    }

    if let Some(version) = session.version() {
        println!("Firmware: {}", version);
    }
    if let Some(parameters) = session.parameters() {
        println!(
            "Capturing {} samples on {} channel(s), trigger level {:#04x}",
            parameters.num_samples, parameters.channels, parameters.trigger_level
        );
    }

    println!("\n4. Connection test completed successfully!");

    Ok(())
}
