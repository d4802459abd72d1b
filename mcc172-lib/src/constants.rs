// Protocol and device constants for the MCC 172

use num_enum::{FromPrimitive, IntoPrimitive};

/// Number of analog input channels on the board.
pub const NUM_CHANNELS: usize = 2;

/// Maximum number of stacked HAT boards the host supports.
pub const MAX_HATS: u8 = 8;

/// Product id reported by the EEPROM and the firmware ID command.
pub const HAT_ID_MCC_172: u16 = 0x0145;

/// Maximum per-channel sample rate in S/s.
pub const MAX_SAMPLE_RATE: f64 = 51200.0;

/// Minimum uncalibrated ADC code (24-bit two's complement).
pub const MIN_CODE: i32 = -8_388_608;

/// Maximum uncalibrated ADC code.
pub const MAX_CODE: i32 = 8_388_607;

/// Lower edge of the input range in volts.
pub const RANGE_MIN: f64 = -5.0;

/// Upper edge of the input range in volts.
pub const RANGE_MAX: f64 = 5.0;

/// Voltage step of one ADC code.
pub const LSB_SIZE: f64 = (RANGE_MAX - RANGE_MIN) / (MAX_CODE as f64 + 1.0);

/// Input voltage at the minimum code.
pub const VOLTAGE_MIN: f64 = RANGE_MIN;

/// Input voltage at the maximum code.
pub const VOLTAGE_MAX: f64 = RANGE_MAX - LSB_SIZE;

/// Frame start byte. Re-synchronises the inbound scanner wherever it appears.
pub const MSG_START: u8 = 0xDB;

/// Outbound frame header: start, command, count_lo, count_hi.
pub const TX_HEADER_SIZE: usize = 4;

/// Inbound frame header: start, command, status, count_lo, count_hi.
pub const RX_HEADER_SIZE: usize = 5;

/// Largest payload the device-side SPI buffer accepts.
pub const MAX_TX_DATA_SIZE: usize = 256;

/// Largest single SPI transfer the host will issue, in bytes.
pub const MAX_SPI_TRANSFER: usize = 4096;

/// Bytes per raw 24-bit sample on the wire.
pub const SAMPLE_SIZE_BYTES: usize = 3;

/// Most samples one AINSCANDATA transfer can carry.
pub const MAX_SAMPLES_READ: usize = (MAX_SPI_TRANSFER - RX_HEADER_SIZE) / SAMPLE_SIZE_BYTES;

/// Hard ceiling on the host-side scan buffer, in samples.
pub const MAX_SCAN_BUFFER_SIZE_SAMPLES: u32 = 16 * 1024 * 1024;

/// Serial number length (characters, without terminator).
pub const SERIAL_LEN: usize = 8;

/// Calibration date length (`YYYY-MM-DD`).
pub const CAL_DATE_LEN: usize = 10;

/// Firmware API command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Command {
    AinScanStart = 0x11,
    AinScanStatus = 0x12,
    AinScanData = 0x13,
    AinScanStop = 0x14,
    AinClockConfigRead = 0x15,
    AinClockConfigWrite = 0x16,
    TriggerConfigRead = 0x17,
    TriggerConfigWrite = 0x18,

    Blink = 0x40,
    Id = 0x41,
    Reset = 0x42,
    IepeConfigRead = 0x43,
    IepeConfigWrite = 0x44,
    TestSignalRead = 0x45,
    TestSignalWrite = 0x46,

    ReadReply = 0x7F,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Status codes in the inbound frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum FwStatus {
    Success = 0x00,
    BadProtocol = 0x01,
    BadParameter = 0x02,
    Busy = 0x03,
    NotReady = 0x04,
    Timeout = 0x05,
    OtherError = 0x06,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Scan option flags passed to [`a_in_scan_start`](crate::Mcc172::a_in_scan_start).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Options(u16);

impl Options {
    /// Default behavior: finite scan, calibrated, scaled to volts.
    pub const DEFAULT: Options = Options(0x0000);
    /// Return raw ADC codes as floats, skip the LSB multiply.
    pub const NOSCALEDATA: Options = Options(0x0001);
    /// Skip the slope/offset calibration.
    pub const NOCALIBRATEDATA: Options = Options(0x0002);
    /// Hold the scan until the external trigger asserts.
    pub const EXTTRIGGER: Options = Options(0x0008);
    /// Scan until stopped, ignoring the finite sample count.
    pub const CONTINUOUS: Options = Options(0x0010);

    pub fn contains(self, other: Options) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Options) -> Options {
        Options(self.0 | other.0)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn from_raw(raw: u16) -> Options {
        Options(raw)
    }
}

impl std::ops::BitOr for Options {
    type Output = Options;

    fn bitor(self, rhs: Options) -> Options {
        self.with(rhs)
    }
}

/// Scan state bits reported by status and read operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanStatus(u16);

impl ScanStatus {
    /// The device missed samples (device-side FIFO overflowed).
    pub const HW_OVERRUN: ScanStatus = ScanStatus(0x0001);
    /// The host ring buffer overflowed; the scan has been terminated.
    pub const BUFFER_OVERRUN: ScanStatus = ScanStatus(0x0002);
    /// The external trigger has been seen.
    pub const TRIGGERED: ScanStatus = ScanStatus(0x0004);
    /// The scan is still acquiring.
    pub const RUNNING: ScanStatus = ScanStatus(0x0008);

    pub fn contains(self, other: ScanStatus) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: ScanStatus) -> ScanStatus {
        ScanStatus(self.0 | other.0)
    }

    pub fn raw(self) -> u16 {
        self.0
    }
}

impl std::ops::BitOr for ScanStatus {
    type Output = ScanStatus;

    fn bitor(self, rhs: ScanStatus) -> ScanStatus {
        self.with(rhs)
    }
}

/// Trigger source selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum TriggerSource {
    #[num_enum(default)]
    Local = 0,
    Master = 1,
    Slave = 2,
}

/// Trigger mode selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum TriggerMode {
    #[num_enum(default)]
    RisingEdge = 0,
    FallingEdge = 1,
    ActiveHigh = 2,
    ActiveLow = 3,
}

/// Static description of the analog input hardware.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceInfo {
    pub num_channels: usize,
    pub min_code: i32,
    pub max_code: i32,
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub min_range: f64,
    pub max_range: f64,
}

/// The fixed [`DeviceInfo`] for every MCC 172.
pub const DEVICE_INFO: DeviceInfo = DeviceInfo {
    num_channels: NUM_CHANNELS,
    min_code: MIN_CODE,
    max_code: MAX_CODE,
    min_voltage: VOLTAGE_MIN,
    max_voltage: VOLTAGE_MAX,
    min_range: RANGE_MIN,
    max_range: RANGE_MAX,
};
