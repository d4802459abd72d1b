//! Factory calibration data stored in the board EEPROM.
//!
//! The EEPROM custom blob is a JSON document:
//!
//! ```json
//! {
//!     "serial": "01234567",
//!     "calibration": {
//!         "date": "2019-03-18",
//!         "slopes": [1.000000, 1.000000],
//!         "offsets": [0.000000, 0.000000]
//!     }
//! }
//! ```
//!
//! Parsing tolerates extra keys but requires serial, date and both
//! per-channel coefficient arrays; anything less falls back to defaults.

use crate::constants::NUM_CHANNELS;
use serde::Deserialize;
use tracing::warn;

/// Per-board factory data with the calibration coefficients.
#[derive(Debug, Clone, PartialEq)]
pub struct FactoryData {
    /// Serial number, at most 8 characters.
    pub serial: String,
    /// Calibration date, `YYYY-MM-DD`.
    pub cal_date: String,
    /// Per-channel calibration slopes. Always exactly [`NUM_CHANNELS`] long.
    pub slopes: Vec<f64>,
    /// Per-channel calibration offsets. Always exactly [`NUM_CHANNELS`] long.
    pub offsets: Vec<f64>,
}

impl Default for FactoryData {
    fn default() -> Self {
        FactoryData {
            serial: "00000000".to_string(),
            cal_date: "1970-01-01".to_string(),
            slopes: vec![1.0; NUM_CHANNELS],
            offsets: vec![0.0; NUM_CHANNELS],
        }
    }
}

#[derive(Deserialize)]
struct RawFactoryData {
    serial: Option<String>,
    calibration: Option<RawCalibration>,
}

#[derive(Deserialize)]
struct RawCalibration {
    date: Option<String>,
    slopes: Option<Vec<f64>>,
    offsets: Option<Vec<f64>>,
}

impl FactoryData {
    /// Decode the EEPROM blob, installing defaults when the document is
    /// absent, malformed or incomplete.
    pub fn parse(address: u8, blob: &[u8]) -> FactoryData {
        match Self::try_parse(blob) {
            Some(data) => data,
            None => {
                warn!(address, "using factory EEPROM default values");
                FactoryData::default()
            }
        }
    }

    fn try_parse(blob: &[u8]) -> Option<FactoryData> {
        if blob.is_empty() {
            return None;
        }
        let raw: RawFactoryData = serde_json::from_slice(blob).ok()?;
        let serial = raw.serial?;
        let cal = raw.calibration?;
        let cal_date = cal.date?;
        let slopes = cal.slopes?;
        let offsets = cal.offsets?;
        if slopes.len() != NUM_CHANNELS || offsets.len() != NUM_CHANNELS {
            return None;
        }
        Some(FactoryData {
            serial,
            cal_date,
            slopes,
            offsets,
        })
    }
}
