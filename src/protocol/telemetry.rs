//! Telemetry notification parsing.
//!
//! Parses notifications from the pressure characteristic and filters them
//! into per-field updates.

use tracing::trace;

use crate::config::DEFAULT_DEAD_BAND_MBAR;
use crate::data::{PartialReading, Reading};
use crate::utils::round_half_even;

/// Resolution of reported pressure values in millibar.
pub const PRESSURE_RESOLUTION_MBAR: i32 = 10;

/// Raw fields of one telemetry notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryFrame {
    /// Pressure in millibar as sent by the device.
    pub raw_pressure: i16,
    /// Temperature in tenths of a degree Celsius, sent with every 16th frame.
    pub raw_temperature: Option<i16>,
}

impl TelemetryFrame {
    /// Size of a pressure-only frame.
    pub const PRESSURE_SIZE: usize = 2;
    /// Size of a frame that also carries temperature.
    pub const FULL_SIZE: usize = 4;

    /// Parse a frame from notification data.
    ///
    /// The layout is:
    /// - Bytes 0-1: pressure in mbar (int16 big-endian)
    /// - Bytes 2-3: temperature in 0.1 °C (int16 big-endian) - optional
    ///
    /// Returns `None` for payloads shorter than two bytes. Extra trailing
    /// bytes are ignored.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::PRESSURE_SIZE {
            return None;
        }

        let raw_pressure = i16::from_be_bytes([data[0], data[1]]);
        let raw_temperature = if data.len() >= Self::FULL_SIZE {
            Some(i16::from_be_bytes([data[2], data[3]]))
        } else {
            None
        };

        Some(Self {
            raw_pressure,
            raw_temperature,
        })
    }

    /// Pressure rounded to the reporting resolution.
    pub fn rounded_pressure(&self) -> i32 {
        round_half_even(i32::from(self.raw_pressure), PRESSURE_RESOLUTION_MBAR)
    }
}

/// Stateful decoder applying rounding and the pressure dead-band.
#[derive(Debug, Clone)]
pub struct TelemetryDecoder {
    /// Minimum pressure change, exclusive, before an update is emitted.
    dead_band_mbar: i32,
    /// Last pressure value that was reported downstream.
    last_reported_pressure: i32,
}

impl Default for TelemetryDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_DEAD_BAND_MBAR)
    }
}

impl TelemetryDecoder {
    /// Create a decoder with a baseline pressure of 0 mbar.
    pub fn new(dead_band_mbar: i32) -> Self {
        Self {
            dead_band_mbar,
            last_reported_pressure: 0,
        }
    }

    /// Get the last pressure value that passed the dead-band.
    pub fn last_reported_pressure(&self) -> i32 {
        self.last_reported_pressure
    }

    /// Decode one notification against the previous snapshot.
    ///
    /// Pressure is rounded half-to-even to 10 mbar and only reported when it
    /// moved strictly more than the dead-band away from the last reported
    /// value. Temperature is reported whenever it differs. Any decodable
    /// frame also signals `now_connected` if `previous` was not connected.
    pub fn decode(&mut self, data: &[u8], previous: &Reading) -> PartialReading {
        let Some(frame) = TelemetryFrame::parse(data) else {
            trace!("Ignoring {}-byte telemetry payload", data.len());
            return PartialReading::default();
        };

        let mut update = PartialReading::default();

        let candidate = frame.rounded_pressure();
        if (candidate - self.last_reported_pressure).abs() > self.dead_band_mbar {
            self.last_reported_pressure = candidate;
            update.pressure_mbar = Some(candidate);
        }

        if let Some(temperature) = frame.raw_temperature {
            if previous.temperature_decicelsius != Some(temperature) {
                update.temperature_decicelsius = Some(temperature);
            }
        }

        update.now_connected = !previous.connected;

        trace!(
            "Telemetry raw={:?} rounded={} update={:?}",
            frame,
            candidate,
            update
        );

        update
    }
}
