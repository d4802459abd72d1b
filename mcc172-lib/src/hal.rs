//! Collaborator contracts for the shared HAT bus.
//!
//! The driver core talks to the outside world through two seams: the
//! per-board SPI character device ([`SpiBus`]) and the shared backplane
//! infrastructure ([`Backplane`]): the cross-process bus lock, the
//! chip-select address mux, the RESET/IRQ GPIO lines and the EEPROM info
//! source. Production code wires up the Linux implementations; tests drive
//! the core with scripted mocks.

use crate::constants::MAX_HATS;
use crate::error::{Error, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
use tracing::{debug, warn};

/// GPIO line driving the board RESET signal.
pub const RESET_GPIO: u8 = 16;

/// GPIO line sensing the board IRQ signal.
pub const IRQ_GPIO: u8 = 20;

// Address-select lines routing the shared chip select.
const ADDR_GPIOS: [u8; 3] = [12, 13, 26];

const SPI_DEVICE: &str = "/dev/spidev0.0";
const SPI_SPEED_HZ: u32 = 20_000_000;
const SPI_BITS: u8 = 8;

const LOCK_FILE: &str = "/tmp/mcc_hat_spi.lock";
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_millis(5);

const EEPROM_DIR: &str = "/var/lib/mcc/hats";

/// Full-duplex SPI access to one board.
///
/// Mode and speed must be re-established on every transaction because other
/// drivers share the bus and may have changed them.
pub trait SpiBus: Send {
    /// Re-assert mode 1 (CPOL=0, CPHA=1), 20 MHz, 8 bits per word.
    fn configure(&mut self) -> io::Result<()>;

    /// Clock `tx` out while reading into `rx`. Both slices have the same
    /// length.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()>;
}

/// EEPROM identity blob for one board address.
#[derive(Debug, Clone)]
pub struct HatInfo {
    /// Product id from the EEPROM header.
    pub id: u16,
    /// Factory calibration JSON, empty when the EEPROM is blank.
    pub custom: Vec<u8>,
}

/// Shared backplane infrastructure: bus lock, address mux, GPIO, EEPROM.
pub trait Backplane: Send + Sync {
    /// Acquire the cross-process SPI lock, bounded to 5 s.
    fn obtain_lock(&self) -> Result<i32>;

    /// Release a lock token returned by [`obtain_lock`](Backplane::obtain_lock).
    fn release_lock(&self, token: i32);

    /// Route the shared chip select to `address`.
    fn set_address(&self, address: u8);

    /// Configure a GPIO line; `input` selects direction.
    fn gpio_dir(&self, pin: u8, input: bool);

    /// Drive an output GPIO line.
    fn gpio_write(&self, pin: u8, value: bool);

    /// Sample a GPIO line.
    fn gpio_status(&self, pin: u8) -> bool;

    /// Read the EEPROM identity for `address`.
    fn hat_info(&self, address: u8) -> Result<HatInfo>;
}

/// RAII bracket around [`Backplane::obtain_lock`]. Every early return in a
/// transaction releases the bus.
pub struct BusLock<'a> {
    backplane: &'a dyn Backplane,
    token: i32,
}

impl<'a> BusLock<'a> {
    pub fn acquire(backplane: &'a dyn Backplane, address: u8) -> Result<BusLock<'a>> {
        let token = backplane.obtain_lock()?;
        backplane.set_address(address);
        Ok(BusLock { backplane, token })
    }
}

impl Drop for BusLock<'_> {
    fn drop(&mut self) {
        self.backplane.release_lock(self.token);
    }
}

/// [`SpiBus`] over a `/dev/spidev` character device.
pub struct SpidevBus {
    spi: Spidev,
}

impl SpidevBus {
    /// Open the shared HAT SPI device node.
    pub fn open() -> Result<SpidevBus> {
        let spi = Spidev::open(SPI_DEVICE)
            .map_err(|_| Error::ResourceUnavail("cannot open SPI device node"))?;
        Ok(SpidevBus { spi })
    }
}

impl SpiBus for SpidevBus {
    fn configure(&mut self) -> io::Result<()> {
        let options = SpidevOptions::new()
            .bits_per_word(SPI_BITS)
            .max_speed_hz(SPI_SPEED_HZ)
            .mode(SpiModeFlags::SPI_MODE_1)
            .build();
        self.spi.configure(&options)
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(tx.len(), rx.len());
        let mut transfer = SpidevTransfer::read_write(tx, rx);
        self.spi.transfer(&mut transfer)
    }
}

/// Linux [`Backplane`]: `flock(2)` on a well-known lock file, sysfs GPIO,
/// and the EEPROM mirror the provisioning tool leaves under
/// `/var/lib/mcc/hats`.
pub struct RpiBackplane {
    eeprom_dir: PathBuf,
}

impl RpiBackplane {
    pub fn new() -> RpiBackplane {
        RpiBackplane {
            eeprom_dir: PathBuf::from(EEPROM_DIR),
        }
    }

    /// Use a non-default EEPROM mirror directory.
    pub fn with_eeprom_dir(dir: impl Into<PathBuf>) -> RpiBackplane {
        RpiBackplane {
            eeprom_dir: dir.into(),
        }
    }

    fn gpio_path(pin: u8, node: &str) -> PathBuf {
        PathBuf::from(format!("/sys/class/gpio/gpio{pin}/{node}"))
    }

    fn export(pin: u8) {
        let dir = PathBuf::from(format!("/sys/class/gpio/gpio{pin}"));
        if dir.exists() {
            return;
        }
        if let Err(err) = fs::write("/sys/class/gpio/export", pin.to_string()) {
            warn!(pin, %err, "GPIO export failed");
        }
    }
}

impl Default for RpiBackplane {
    fn default() -> Self {
        Self::new()
    }
}

impl Backplane for RpiBackplane {
    fn obtain_lock(&self) -> Result<i32> {
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(LOCK_FILE)
            .map_err(|_| Error::LockTimeout)?;
        let fd = {
            use std::os::unix::io::IntoRawFd;
            file.into_raw_fd()
        };

        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            let ret = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if ret == 0 {
                return Ok(fd);
            }
            if Instant::now() >= deadline {
                unsafe { libc::close(fd) };
                return Err(Error::LockTimeout);
            }
            std::thread::sleep(LOCK_RETRY);
        }
    }

    fn release_lock(&self, token: i32) {
        unsafe {
            libc::flock(token, libc::LOCK_UN);
            libc::close(token);
        }
    }

    fn set_address(&self, address: u8) {
        for (bit, &pin) in ADDR_GPIOS.iter().enumerate() {
            Self::export(pin);
            let _ = fs::write(Self::gpio_path(pin, "direction"), "out");
            let value = if address & (1 << bit) != 0 { "1" } else { "0" };
            let _ = fs::write(Self::gpio_path(pin, "value"), value);
        }
    }

    fn gpio_dir(&self, pin: u8, input: bool) {
        Self::export(pin);
        let dir = if input { "in" } else { "out" };
        if let Err(err) = fs::write(Self::gpio_path(pin, "direction"), dir) {
            warn!(pin, dir, %err, "GPIO direction write failed");
        }
    }

    fn gpio_write(&self, pin: u8, value: bool) {
        let value = if value { "1" } else { "0" };
        if let Err(err) = fs::write(Self::gpio_path(pin, "value"), value) {
            warn!(pin, value, %err, "GPIO value write failed");
        }
    }

    fn gpio_status(&self, pin: u8) -> bool {
        match fs::read_to_string(Self::gpio_path(pin, "value")) {
            Ok(text) => text.trim() == "1",
            Err(err) => {
                warn!(pin, %err, "GPIO value read failed");
                false
            }
        }
    }

    fn hat_info(&self, address: u8) -> Result<HatInfo> {
        if address >= MAX_HATS {
            return Err(Error::BadParameter("address out of range"));
        }
        let base = self.eeprom_dir.join(format!("hat_{address}"));
        let id = read_product_id(&base.join("product_id"))?;
        let custom = fs::read(base.join("custom")).unwrap_or_default();
        debug!(address, id, custom_len = custom.len(), "read EEPROM info");
        Ok(HatInfo { id, custom })
    }
}

fn read_product_id(path: &Path) -> Result<u16> {
    let text = fs::read_to_string(path)
        .map_err(|_| Error::ResourceUnavail("no EEPROM image for address"))?;
    let text = text.trim().trim_start_matches("0x");
    u16::from_str_radix(text, 16)
        .map_err(|_| Error::Undefined(format!("malformed product id {text:?}")))
}
