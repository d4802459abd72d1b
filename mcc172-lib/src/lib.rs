//! Host-side driver for the MCC 172 two-channel 24-bit IEPE acquisition HAT.
//!
//! The board streams at up to 51.2 kS/s per channel over the shared HAT SPI
//! bus. This crate implements the framed command protocol, a background
//! producer that keeps a host-side ring buffer fed during a scan, and the
//! blocking consumer read API.
//!
//! # Example
//!
//! ```no_run
//! use mcc172_lib::{Mcc172, Options};
//!
//! # fn example() -> mcc172_lib::Result<()> {
//! let board = Mcc172::open(0)?;
//! board.a_in_clock_config_write(0, 10240.0)?;
//!
//! board.a_in_scan_start(0b11, 1000, Options::DEFAULT)?;
//! let mut samples = vec![0.0; 2000];
//! let read = board.a_in_scan_read(1000, 5.0, &mut samples)?;
//! println!("{} samples per channel", read.samples_read_per_channel);
//! board.a_in_scan_cleanup()?;
//! # Ok(())
//! # }
//! ```

pub mod constants;
pub mod error;
pub mod factory;
pub mod frame;
pub mod hal;

mod device;
mod ring;
mod scan;

pub use constants::{
    Command, DeviceInfo, FwStatus, Options, ScanStatus, TriggerMode, TriggerSource, LSB_SIZE,
    MAX_HATS, MAX_SAMPLE_RATE, NUM_CHANNELS,
};
pub use device::{device_info, is_open, ClockConfig, Mcc172, TestSignals};
pub use error::{Error, Result};
pub use factory::FactoryData;
pub use scan::ScanRead;
