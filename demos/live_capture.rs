// Continuous capture example
//
// Streams captures from the oscilloscope and prints per-frame statistics,
// optionally exporting the last frame as a DataFrame.

use clap::Parser;
use oscope_link::sample::{sample_rate_hz, DEFAULT_CPU_HZ};
use oscope_link::{
    LinkConfig, LinkConsumer, OscopeConnector, SampleFrame, TriggerConfig, VoltageReference,
};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "live_capture")]
#[command(version = "1.0")]
#[command(about = "Continuously capture from an oscilloscope")]
struct Args {
    /// Serial port, discovered automatically when omitted
    #[arg(short, long)]
    port: Option<String>,

    /// Capture duration in seconds
    #[arg(short, long, default_value_t = 5)]
    seconds: u64,

    /// Raw trigger level
    #[arg(short, long, default_value_t = 0x80)]
    level: u8,

    /// ADC prescaler (log2 of the divider, 1..=7)
    #[arg(long, default_value_t = 7)]
    prescaler: u8,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

#[derive(Default)]
struct Stats {
    frames: usize,
    last: Option<SampleFrame>,
}

impl LinkConsumer for Stats {
    fn on_sample_frame(&mut self, samples: &[u8]) {
        self.frames += 1;
        match SampleFrame::parse(samples) {
            Ok(frame) => {
                if let Some(ch0) = frame.channel(0) {
                    let min = ch0.iter().min().copied().unwrap_or_default();
                    let max = ch0.iter().max().copied().unwrap_or_default();
                    println!(
                        "Frame {}: {} samples x {} channel(s), min {} max {}",
                        self.frames,
                        frame.samples_per_channel(),
                        frame.channels(),
                        min,
                        max
                    );
                }
                self.last = Some(frame);
            }
            Err(e) => eprintln!("Frame {}: {}", self.frames, e),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let mut session =
        OscopeConnector::connect(args.port.as_deref(), Stats::default(), LinkConfig::default())?;

    session.set_vref(VoltageReference::Avcc)?;
    session.set_prescaler(args.prescaler)?;
    session.apply_trigger(&TriggerConfig::start_capturing_when().rising_edge(args.level))?;

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    while Instant::now() < deadline {
        if session.pump()? == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        session.poll(Instant::now())?;
    }

    let stats = session.stats();
    println!(
        "\n{} frames, {} checksum errors, {} ignored",
        stats.sample_frames, stats.checksum_errors, stats.ignored
    );

    if let Some(frame) = &session.consumer().last {
        let rate = sample_rate_hz(DEFAULT_CPU_HZ, args.prescaler);
        println!("{}", frame.to_dataframe(rate)?.head(Some(10)));
    }

    Ok(())
}
