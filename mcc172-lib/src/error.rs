use crate::constants::ScanStatus;
use thiserror::Error;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The primary error type for the `mcc172` driver.
///
/// Firmware status codes map onto these one-to-one: `0x02` is
/// [`BadParameter`](Error::BadParameter), `0x03` is [`Busy`](Error::Busy),
/// `0x05` is [`Timeout`](Error::Timeout) and every other non-zero code is
/// [`Undefined`](Error::Undefined).
#[derive(Error, Debug)]
pub enum Error {
    /// Out-of-range address, channel or mask, an undersized buffer, or a
    /// reply whose command byte does not match the request.
    #[error("bad parameter: {0}")]
    BadParameter(&'static str),

    /// The firmware refused the command, or a host-side configuration write
    /// was attempted while a scan is active.
    #[error("device is busy")]
    Busy,

    /// A reply or trigger deadline expired.
    #[error("operation timed out")]
    Timeout,

    /// The cross-process SPI bus lock could not be obtained within 5 s.
    #[error("could not obtain the SPI bus lock within 5 s")]
    LockTimeout,

    /// Allocation, thread creation or device-node open failed, or the
    /// queried scan session does not exist.
    #[error("resource unavailable: {0}")]
    ResourceUnavail(&'static str),

    /// The board at this address did not identify as an MCC 172.
    #[error("device at address {address} is not an MCC 172 (id 0x{id:04x})")]
    InvalidDevice { address: u8, id: u16 },

    /// An ioctl failed or the firmware returned a status outside the
    /// known set.
    #[error("undefined failure: {0}")]
    Undefined(String),

    /// The scan-read deadline expired before the requested sample count was
    /// reached. The samples counted here are already in the caller's
    /// buffer.
    #[error("scan read timed out with {samples_read_per_channel} samples per channel delivered")]
    ReadTimeout {
        status: ScanStatus,
        samples_read_per_channel: u32,
    },
}

impl Error {
    pub(crate) fn io(context: &str, err: std::io::Error) -> Error {
        Error::Undefined(format!("{context}: {err}"))
    }
}
