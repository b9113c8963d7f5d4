//! ==============================================================================
//! codec.rs - uplink frame payload decoder
//! ==============================================================================
//!
//! purpose:
//!     turns the raw bytes of a weather-sensor uplink into physical values.
//!     pure function, no logging, no clock reads. the caller stamps the time
//!     and attaches the device id.
//!
//! frame layout (big-endian, minimum 7 bytes, trailing bytes ignored):
//!
//! ```text
//!     offset  size  field        scale
//!     0       2     reserved     -
//!     2       2     temperature  raw / 10.0   -> °C
//!     4       2     battery      raw / 1000.0 -> V   (0x0000 = not encoded)
//!     6       1     humidity     raw / 2.0    -> %
//!
//!     example: 00 00 00 C8 00 00 32  ->  20.0 °C, 25.0 %, no battery
//! ```
//!
//! relationships:
//!     - used by: ingest.rs (message handler step 5)
//!
//! ==============================================================================

use crate::domain::Reading;
use crate::error::DecodeError;

/// shortest frame the sensors send
pub const MIN_FRAME_LEN: usize = 7;

const TEMPERATURE_OFFSET: usize = 2;
const BATTERY_OFFSET: usize = 4;
const HUMIDITY_OFFSET: usize = 6;

const TEMPERATURE_SCALE: f64 = 10.0;
const BATTERY_SCALE: f64 = 1000.0;
const HUMIDITY_SCALE: f64 = 2.0;

/// physical values of one frame, before a device id and timestamp are attached
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DecodedFrame {
    pub temperature_celsius: f64,
    pub humidity_percent: f64,
    pub battery_volts: Option<f64>,
}

impl DecodedFrame {
    pub fn into_reading(self, device_id: impl Into<String>, observed_at_ms: u64) -> Reading {
        Reading {
            device_id: device_id.into(),
            temperature_celsius: self.temperature_celsius,
            humidity_percent: self.humidity_percent,
            battery_volts: self.battery_volts,
            observed_at_ms,
        }
    }
}

/// Decode an uplink frame payload.
///
/// # Errors
/// [`DecodeError::TooShort`] when `raw` has fewer than [`MIN_FRAME_LEN`] bytes.
/// All fields are fixed-width unsigned, so any frame of sufficient length decodes.
pub fn decode(raw: &[u8]) -> Result<DecodedFrame, DecodeError> {
    if raw.len() < MIN_FRAME_LEN {
        return Err(DecodeError::TooShort {
            len: raw.len(),
            min: MIN_FRAME_LEN,
        });
    }

    let temperature_raw = read_u16_be(raw, TEMPERATURE_OFFSET);
    let battery_raw = read_u16_be(raw, BATTERY_OFFSET);
    let humidity_raw = raw[HUMIDITY_OFFSET];

    Ok(DecodedFrame {
        temperature_celsius: f64::from(temperature_raw) / TEMPERATURE_SCALE,
        humidity_percent: f64::from(humidity_raw) / HUMIDITY_SCALE,
        battery_volts: (battery_raw != 0).then(|| f64::from(battery_raw) / BATTERY_SCALE),
    })
}

// caller has checked the length
fn read_u16_be(raw: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([raw[offset], raw[offset + 1]])
}

/// lowercase hex for diagnostics
pub fn to_hex(raw: &[u8]) -> String {
    raw.iter().map(|b| format!("{:02x}", b)).collect()
}
