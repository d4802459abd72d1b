use mcc172_lib::{Mcc172, Options, ScanStatus};
use std::error::Error;

const ADDRESS: u8 = 0;
const SAMPLE_RATE: f64 = 10240.0;
const SAMPLES_PER_CHANNEL: u32 = 1024;
const CHANNEL_MASK: u8 = 0b11;

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Open the board
    let board = Mcc172::open(ADDRESS)?;
    println!("Connected to MCC 172 at address {ADDRESS}");
    println!("  Serial: {}", board.serial());
    println!("  Calibration date: {}", board.calibration_date());
    println!("  Firmware: {:#06x}", board.firmware_version());
    for channel in 0..2 {
        let (slope, offset) = board.calibration_coefficient_read(channel)?;
        println!("  Channel {channel}: slope {slope:.6}, offset {offset:.6}");
    }

    // Configure the clock and wait for the achieved rate
    board.a_in_clock_config_write(0, SAMPLE_RATE)?;
    let clock = board.a_in_clock_config_read()?;
    println!(
        "Clock: {:.1} S/s per channel (synced: {})",
        clock.sample_rate_per_channel, clock.synced
    );

    // Run a finite scan on both channels
    println!("Scanning {SAMPLES_PER_CHANNEL} samples per channel...");
    board.a_in_scan_start(CHANNEL_MASK, SAMPLES_PER_CHANNEL, Options::DEFAULT)?;

    let channel_count = board.a_in_scan_channel_count() as usize;
    let mut samples = vec![0.0f64; SAMPLES_PER_CHANNEL as usize * channel_count];
    let read = board.a_in_scan_read(SAMPLES_PER_CHANNEL as i32, 5.0, &mut samples)?;

    println!(
        "Read {} samples per channel (running: {})",
        read.samples_read_per_channel,
        read.status.contains(ScanStatus::RUNNING)
    );
    for scan in samples.chunks_exact(channel_count).take(5) {
        let fields: Vec<String> = scan.iter().map(|v| format!("{v:+.6} V")).collect();
        println!("  {}", fields.join("  "));
    }

    board.a_in_scan_cleanup()?;
    board.close();

    Ok(())
}
