//! Device registry, handles, and the SPI transaction layer.
//!
//! One record exists per board address. The first [`Mcc172::open`] for an
//! address allocates the record, brings up the GPIO lines, opens the SPI
//! node, decodes the EEPROM calibration blob and runs the ID handshake;
//! later opens share the record. The record is reclaimed when the last
//! handle closes, after the scan producer (if any) has been joined.

use crate::constants::{
    Command, DeviceInfo, FwStatus, TriggerMode, TriggerSource, DEVICE_INFO, HAT_ID_MCC_172,
    MAX_HATS, MAX_SAMPLE_RATE, NUM_CHANNELS, RX_HEADER_SIZE,
};
use crate::error::{Error, Result};
use crate::factory::FactoryData;
use crate::frame;
use crate::hal::{Backplane, BusLock, RpiBackplane, SpiBus, SpidevBus, IRQ_GPIO, RESET_GPIO};
use crate::scan::ScanSession;
use num_enum::FromPrimitive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Reply deadline used by ordinary configuration commands.
pub(crate) const CONFIG_TIMEOUT: Duration = Duration::from_millis(20);

const ID_RETRY: Duration = Duration::from_micros(10);
const IOCTL_BACKOFF: Duration = Duration::from_micros(300);

pub(crate) struct DeviceState {
    pub fw_version: u16,
    pub trigger_source: TriggerSource,
    pub trigger_mode: TriggerMode,
    pub factory: FactoryData,
}

/// Per-address device record shared by all handles and the scan producer.
pub(crate) struct DeviceShared {
    pub address: u8,
    pub backplane: Arc<dyn Backplane>,
    pub spi: Mutex<Box<dyn SpiBus>>,
    pub state: Mutex<DeviceState>,
    pub scan: Mutex<Option<ScanSession>>,
    /// Raised while a scan is being armed, before the session is published.
    /// Config writers check this so they report Busy during the clock
    /// rendezvous instead of stalling on the session mutex.
    pub arming: AtomicBool,
}

struct Slot {
    dev: Arc<DeviceShared>,
    handles: u16,
}

struct Registry {
    slots: Vec<Option<Slot>>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            slots: (0..MAX_HATS as usize).map(|_| None).collect(),
        })
    })
}

/// Whether any handle is currently open for `address`.
pub fn is_open(address: u8) -> bool {
    if address >= MAX_HATS {
        return false;
    }
    registry().lock().unwrap().slots[address as usize].is_some()
}

/// Static description of the analog inputs, identical for every board.
pub fn device_info() -> DeviceInfo {
    DEVICE_INFO
}

/// A handle to one MCC 172 board.
///
/// Handles are reference counted per address: every `open` for the same
/// address shares the underlying record, and the record is torn down when
/// the last handle is closed or dropped. Teardown joins the scan producer
/// before any buffer is released.
pub struct Mcc172 {
    pub(crate) dev: Arc<DeviceShared>,
    address: u8,
    closed: bool,
}

impl std::fmt::Debug for Mcc172 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mcc172")
            .field("address", &self.address)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Mcc172 {
    /// Open the board at `address` on the Raspberry Pi backplane.
    pub fn open(address: u8) -> Result<Mcc172> {
        Self::open_inner(address, false, || {
            Ok((
                Arc::new(RpiBackplane::new()) as Arc<dyn Backplane>,
                Box::new(SpidevBus::open()?) as Box<dyn SpiBus>,
            ))
        })
    }

    /// Open for a firmware update: identical to [`open`](Mcc172::open)
    /// except a failed ID handshake is tolerated, since the target may be
    /// unprogrammed.
    pub fn open_for_update(address: u8) -> Result<Mcc172> {
        Self::open_inner(address, true, || {
            Ok((
                Arc::new(RpiBackplane::new()) as Arc<dyn Backplane>,
                Box::new(SpidevBus::open()?) as Box<dyn SpiBus>,
            ))
        })
    }

    /// Open with an injected backplane and SPI bus. The provided parts are
    /// only used when this is the first open for the address.
    pub fn open_with(
        address: u8,
        backplane: Arc<dyn Backplane>,
        spi: Box<dyn SpiBus>,
    ) -> Result<Mcc172> {
        Self::open_inner(address, false, move || Ok((backplane, spi)))
    }

    /// [`open_for_update`](Mcc172::open_for_update) with injected parts.
    pub fn open_for_update_with(
        address: u8,
        backplane: Arc<dyn Backplane>,
        spi: Box<dyn SpiBus>,
    ) -> Result<Mcc172> {
        Self::open_inner(address, true, move || Ok((backplane, spi)))
    }

    fn open_inner(
        address: u8,
        for_update: bool,
        provider: impl FnOnce() -> Result<(Arc<dyn Backplane>, Box<dyn SpiBus>)>,
    ) -> Result<Mcc172> {
        if address >= MAX_HATS {
            return Err(Error::BadParameter("address out of range"));
        }

        let mut reg = registry().lock().unwrap();
        if let Some(slot) = reg.slots[address as usize].as_mut() {
            slot.handles += 1;
            debug!(address, handles = slot.handles, "reopened device");
            return Ok(Mcc172 {
                dev: Arc::clone(&slot.dev),
                address,
                closed: false,
            });
        }

        let (backplane, spi) = provider()?;

        // Verify the EEPROM identity when present; a blank EEPROM is allowed
        // so an unprovisioned board can still be opened.
        let custom = match backplane.hat_info(address) {
            Ok(eeprom) => {
                if eeprom.id != HAT_ID_MCC_172 {
                    return Err(Error::InvalidDevice {
                        address,
                        id: eeprom.id,
                    });
                }
                eeprom.custom
            }
            Err(_) => {
                warn!(address, "no EEPROM info found, opening uninitialised board");
                Vec::new()
            }
        };

        backplane.gpio_write(RESET_GPIO, false);
        backplane.gpio_dir(RESET_GPIO, false);
        backplane.gpio_dir(IRQ_GPIO, true);

        let factory = FactoryData::parse(address, &custom);

        let dev = Arc::new(DeviceShared {
            address,
            backplane,
            spi: Mutex::new(spi),
            state: Mutex::new(DeviceState {
                fw_version: 0,
                trigger_source: TriggerSource::Local,
                trigger_mode: TriggerMode::RisingEdge,
                factory,
            }),
            scan: Mutex::new(None),
            arming: AtomicBool::new(false),
        });

        // ID handshake: confirm the firmware answers as an MCC 172 and cache
        // its version. Two attempts, since the micro may still be waking.
        let mut handshake = Err(Error::Timeout);
        for attempt in 0..2 {
            let mut id_data = [0u8; 4];
            handshake = dev
                .transfer(Command::Id, &[], &mut id_data, CONFIG_TIMEOUT, ID_RETRY)
                .map(|()| id_data);
            match &handshake {
                Ok(_) => break,
                Err(err) => trace!(address, attempt, %err, "ID command failed"),
            }
        }
        match handshake {
            Ok(id_data) => {
                let id = u16::from_le_bytes([id_data[0], id_data[1]]);
                let version = u16::from_le_bytes([id_data[2], id_data[3]]);
                if id != HAT_ID_MCC_172 {
                    return Err(Error::InvalidDevice { address, id });
                }
                dev.state.lock().unwrap().fw_version = version;
                info!(address, fw_version = version, "opened device");
            }
            Err(err) => {
                if !for_update {
                    return Err(err);
                }
                info!(address, "opened unresponsive device for update");
            }
        }

        reg.slots[address as usize] = Some(Slot {
            dev: Arc::clone(&dev),
            handles: 1,
        });

        Ok(Mcc172 {
            dev,
            address,
            closed: false,
        })
    }

    /// Board address this handle refers to.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Close this handle. The device record is released when the last
    /// handle for the address closes; an active scan is cleaned up first.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut reg = registry().lock().unwrap();
        let slot = reg.slots[self.address as usize]
            .as_mut()
            .expect("open handle without registry slot");
        slot.handles -= 1;
        if slot.handles == 0 {
            // Stop the producer before the record (and its ring) goes away.
            let _ = self.a_in_scan_cleanup();
            reg.slots[self.address as usize] = None;
            debug!(address = self.address, "closed device");
        }
    }

    // ------------------------------------------------------------------
    // Identity and calibration

    /// Cached firmware version from the ID handshake.
    pub fn firmware_version(&self) -> u16 {
        self.dev.state.lock().unwrap().fw_version
    }

    /// Factory serial number.
    pub fn serial(&self) -> String {
        self.dev.state.lock().unwrap().factory.serial.clone()
    }

    /// Factory calibration date (`YYYY-MM-DD`).
    pub fn calibration_date(&self) -> String {
        self.dev.state.lock().unwrap().factory.cal_date.clone()
    }

    /// Read the calibration slope and offset for `channel`.
    pub fn calibration_coefficient_read(&self, channel: u8) -> Result<(f64, f64)> {
        if channel as usize >= NUM_CHANNELS {
            return Err(Error::BadParameter("channel out of range"));
        }
        let state = self.dev.state.lock().unwrap();
        Ok((
            state.factory.slopes[channel as usize],
            state.factory.offsets[channel as usize],
        ))
    }

    /// Overwrite the calibration coefficients for `channel` until the next
    /// open. Rejected while a scan is active.
    pub fn calibration_coefficient_write(
        &self,
        channel: u8,
        slope: f64,
        offset: f64,
    ) -> Result<()> {
        if channel as usize >= NUM_CHANNELS {
            return Err(Error::BadParameter("channel out of range"));
        }
        self.ensure_not_scanning()?;
        let mut state = self.dev.state.lock().unwrap();
        state.factory.slopes[channel as usize] = slope;
        state.factory.offsets[channel as usize] = offset;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Simple commands

    /// Blink the board LED `count` times.
    pub fn blink_led(&self, count: u8) -> Result<()> {
        self.dev.transfer(
            Command::Blink,
            &[count],
            &mut [],
            CONFIG_TIMEOUT,
            Duration::ZERO,
        )
    }

    /// Reset the board micro.
    pub fn reset(&self) -> Result<()> {
        self.dev
            .transfer(Command::Reset, &[], &mut [], CONFIG_TIMEOUT, Duration::ZERO)
    }

    /// Read the IEPE excitation state for `channel`.
    pub fn iepe_config_read(&self, channel: u8) -> Result<bool> {
        if channel as usize >= NUM_CHANNELS {
            return Err(Error::BadParameter("channel out of range"));
        }
        let mut config = [0u8; 1];
        self.dev.transfer(
            Command::IepeConfigRead,
            &[],
            &mut config,
            CONFIG_TIMEOUT,
            Duration::ZERO,
        )?;
        Ok((config[0] >> channel) & 0x01 == 0x01)
    }

    /// Enable or disable IEPE excitation for `channel`. The device keeps one
    /// config byte for both channels, so this is a read-modify-write.
    /// Rejected while a scan is active.
    pub fn iepe_config_write(&self, channel: u8, enable: bool) -> Result<()> {
        if channel as usize >= NUM_CHANNELS {
            return Err(Error::BadParameter("channel out of range"));
        }
        self.ensure_not_scanning()?;

        let mut config = [0u8; 1];
        self.dev.transfer(
            Command::IepeConfigRead,
            &[],
            &mut config,
            CONFIG_TIMEOUT,
            Duration::ZERO,
        )?;
        if enable {
            config[0] |= 1 << channel;
        } else {
            config[0] &= !(1 << channel);
        }
        self.dev.transfer(
            Command::IepeConfigWrite,
            &config,
            &mut [],
            CONFIG_TIMEOUT,
            Duration::ZERO,
        )
    }

    /// Read the ADC clock configuration.
    pub fn a_in_clock_config_read(&self) -> Result<ClockConfig> {
        let mut reply = [0u8; 2];
        self.dev.transfer(
            Command::AinClockConfigRead,
            &[],
            &mut reply,
            CONFIG_TIMEOUT,
            Duration::ZERO,
        )?;
        Ok(ClockConfig {
            clock_source: reply[0] & 0x03,
            sample_rate_per_channel: MAX_SAMPLE_RATE / (reply[1] as f64 + 1.0),
            synced: (reply[0] >> 7) & 0x01 == 0x01,
        })
    }

    /// Configure the ADC clock. The requested rate is coerced to the nearest
    /// achievable divisor of 51.2 kS/s; read the configuration back for the
    /// actual rate. Rejected while a scan is active.
    pub fn a_in_clock_config_write(
        &self,
        clock_source: u8,
        sample_rate_per_channel: f64,
    ) -> Result<()> {
        if clock_source > 1 {
            return Err(Error::BadParameter("clock source out of range"));
        }
        self.ensure_not_scanning()?;

        let divisor = (MAX_SAMPLE_RATE / sample_rate_per_channel + 0.5).clamp(1.0, 256.0);
        let request = [clock_source, (divisor as u16 - 1) as u8];
        self.dev.transfer(
            Command::AinClockConfigWrite,
            &request,
            &mut [],
            CONFIG_TIMEOUT,
            Duration::ZERO,
        )
    }

    /// Configure the trigger input. Rejected while a scan is active.
    pub fn trigger_config(&self, source: TriggerSource, mode: TriggerMode) -> Result<()> {
        self.ensure_not_scanning()?;

        let request = [(u8::from(mode) << 2) | u8::from(source)];
        self.dev.transfer(
            Command::TriggerConfigWrite,
            &request,
            &mut [],
            CONFIG_TIMEOUT,
            Duration::ZERO,
        )?;

        let mut state = self.dev.state.lock().unwrap();
        state.trigger_source = source;
        state.trigger_mode = mode;
        Ok(())
    }

    /// Read the shared clock/sync/trigger line states, for factory test.
    pub fn test_signals_read(&self) -> Result<TestSignals> {
        let mut reply = [0u8; 1];
        self.dev.transfer(
            Command::TestSignalRead,
            &[],
            &mut reply,
            CONFIG_TIMEOUT,
            Duration::ZERO,
        )?;
        Ok(TestSignals {
            clock: reply[0] & 0x01 == 0x01,
            sync: (reply[0] >> 1) & 0x01 == 0x01,
            trigger: (reply[0] >> 2) & 0x01 == 0x01,
        })
    }

    /// Drive the shared clock/sync lines, for factory test.
    pub fn test_signals_write(&self, mode: bool, clock: bool, sync: bool) -> Result<()> {
        let mut request = 0u8;
        if mode {
            request |= 0x01;
        }
        if clock {
            request |= 0x02;
        }
        if sync {
            request |= 0x04;
        }
        self.dev.transfer(
            Command::TestSignalWrite,
            &[request],
            &mut [],
            CONFIG_TIMEOUT,
            Duration::ZERO,
        )
    }

    // ------------------------------------------------------------------
    // Bootloader transport

    /// Pulse RESET until the bootloader signals ready on IRQ.
    pub fn enter_bootloader(&self) -> Result<()> {
        let backplane = &*self.dev.backplane;
        let _lock = BusLock::acquire(backplane, self.address)?;

        let mut count = 0;
        while backplane.gpio_status(IRQ_GPIO) && count <= 10 {
            std::thread::sleep(Duration::from_millis(10));
            backplane.gpio_write(RESET_GPIO, true);
            std::thread::sleep(Duration::from_millis(1));
            backplane.gpio_write(RESET_GPIO, false);
            count += 1;
        }

        if backplane.gpio_status(IRQ_GPIO) {
            let deadline = Instant::now() + Duration::from_millis(100);
            while backplane.gpio_status(IRQ_GPIO) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            if backplane.gpio_status(IRQ_GPIO) {
                warn!(address = self.address, "bootloader IRQ never went low");
                return Err(Error::Timeout);
            }
        }

        Ok(())
    }

    /// Whether the bootloader is ready for the next block (IRQ low).
    pub fn bl_ready(&self) -> bool {
        !self.dev.backplane.gpio_status(IRQ_GPIO)
    }

    /// Opaque full-duplex transfer for the firmware loader. No framing is
    /// applied; the block format belongs to the bootloader.
    pub fn bl_transfer(&self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        if tx.len() != rx.len() {
            return Err(Error::BadParameter("tx/rx length mismatch"));
        }
        let _lock = BusLock::acquire(&*self.dev.backplane, self.address)?;

        let mut spi = self.dev.spi.lock().unwrap();
        spi.configure()
            .map_err(|err| Error::io("SPI configure failed", err))?;
        spi.transfer(tx, rx)
            .map_err(|err| Error::io("bootloader transfer failed", err))
    }

    pub(crate) fn ensure_not_scanning(&self) -> Result<()> {
        if self.dev.arming.load(Ordering::Acquire) || self.dev.scan.lock().unwrap().is_some() {
            return Err(Error::Busy);
        }
        Ok(())
    }
}

impl Drop for Mcc172 {
    fn drop(&mut self) {
        self.release();
    }
}

/// ADC clock configuration as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockConfig {
    /// 0 = local clock, 1 = master of the shared clock.
    pub clock_source: u8,
    /// Achieved per-channel sample rate in S/s.
    pub sample_rate_per_channel: f64,
    /// Whether the board has settled onto the shared clock.
    pub synced: bool,
}

/// Shared backplane signal states, for factory test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestSignals {
    pub clock: bool,
    pub sync: bool,
    pub trigger: bool,
}

impl DeviceShared {
    /// One framed command/response transaction.
    ///
    /// Brackets the exchange with the cross-process bus lock and the address
    /// mux, re-asserts the SPI mode (the bus is shared with other drivers),
    /// clocks out the command, polls for the ready byte, then reads and
    /// parses the reply, mapping the firmware status onto [`Error`].
    pub(crate) fn transfer(
        &self,
        command: Command,
        tx_payload: &[u8],
        rx_payload: &mut [u8],
        reply_timeout: Duration,
        retry: Duration,
    ) -> Result<()> {
        let request = frame::encode(command, tx_payload)?;

        let _lock = BusLock::acquire(&*self.backplane, self.address)?;
        let mut spi = self.spi.lock().unwrap();

        spi.configure()
            .map_err(|err| Error::io("SPI configure failed", err))?;

        // Clock out the command; the inbound bytes during this phase are
        // meaningless.
        let mut scratch = vec![0u8; request.len()];
        spi.transfer(&request, &mut scratch)
            .map_err(|err| Error::io("command transfer failed", err))?;

        if !retry.is_zero() {
            std::thread::sleep(retry);
        }

        // Ready poll: a non-zero byte means the reply has started.
        let deadline = Instant::now() + reply_timeout;
        let mut ready_byte = [0u8; 1];
        loop {
            if spi.transfer(&[0], &mut ready_byte).is_ok() && ready_byte[0] != 0 {
                break;
            }
            if Instant::now() > deadline {
                trace!(address = self.address, ?command, "reply ready-poll timed out");
                return Err(Error::Timeout);
            }
            if ready_byte[0] == 0 && !retry.is_zero() {
                std::thread::sleep(retry);
            }
        }

        // Body read: splice the remaining header and payload bytes after the
        // ready byte and hand the lot to the frame scanner. A failed ioctl
        // backs off 300 us and retries within the same deadline.
        let read_amount = RX_HEADER_SIZE + rx_payload.len();
        let body_tx = vec![0u8; read_amount];
        let mut reply = vec![0u8; 1 + read_amount];
        reply[0] = ready_byte[0];

        let outcome = loop {
            match spi.transfer(&body_tx, &mut reply[1..]) {
                Ok(()) => {
                    let outcome = frame::scan(&reply);
                    if outcome.found {
                        break outcome;
                    }
                }
                Err(err) => {
                    debug!(address = self.address, %err, "reply transfer failed");
                    std::thread::sleep(IOCTL_BACKOFF);
                }
            }
            if Instant::now() > deadline {
                trace!(address = self.address, ?command, "reply body timed out");
                return Err(Error::Timeout);
            }
        };

        let rx_frame = frame::split_frame(&reply, outcome);
        if rx_frame.command != command {
            return Err(Error::BadParameter("reply command mismatch"));
        }

        match FwStatus::from_primitive(rx_frame.status) {
            FwStatus::Success => {
                let count = rx_payload.len().min(rx_frame.payload.len());
                rx_payload[..count].copy_from_slice(&rx_frame.payload[..count]);
                Ok(())
            }
            FwStatus::BadParameter => Err(Error::BadParameter("firmware rejected parameters")),
            FwStatus::Busy => Err(Error::Busy),
            FwStatus::Timeout => Err(Error::Timeout),
            other => Err(Error::Undefined(format!(
                "firmware status {:#04x}",
                u8::from(other)
            ))),
        }
    }
}
