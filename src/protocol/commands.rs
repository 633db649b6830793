//! Command encoding and battery decoding.

use tracing::warn;

/// Value written to the calibration characteristic to zero the sensor.
pub const ZERO_COMMAND: u8 = 0x00;

/// Encode the zero calibration command.
///
/// Must be written with response so a lost acknowledgement surfaces as a
/// failure.
pub fn encode_zero_command() -> [u8; 1] {
    [ZERO_COMMAND]
}

/// Decode a battery level read.
///
/// The first byte is the percentage. Returns `None` for an empty payload.
/// Values above 100 are clamped.
pub fn decode_battery(data: &[u8]) -> Option<u8> {
    let percent = *data.first()?;
    if percent > 100 {
        warn!("Battery level {} out of range, clamping to 100", percent);
    }
    Some(percent.min(100))
}
