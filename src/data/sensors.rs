//! Sensor descriptions for presentation layers.
//!
//! Each [`SensorKind`] maps to a pure extractor over a [`Reading`], so one
//! description drives one readout without per-field closures.

use super::reading::Reading;

/// The values a reading exposes as individual sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SensorKind {
    /// Pressure in millibar.
    Pressure,
    /// Temperature in degrees Celsius.
    Temperature,
    /// Battery charge in percent.
    Battery,
}

/// Static metadata for a sensor readout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorDescription {
    /// Which value this describes.
    pub kind: SensorKind,
    /// Stable key for unique identifiers.
    pub key: &'static str,
    /// Unit of measurement.
    pub unit: &'static str,
    /// Suggested number of decimals when displaying.
    pub display_precision: u8,
}

/// All sensors a Pressensor exposes.
pub static SENSORS: [SensorDescription; 3] = [
    SensorDescription {
        kind: SensorKind::Pressure,
        key: "pressure",
        unit: "mbar",
        display_precision: 0,
    },
    SensorDescription {
        kind: SensorKind::Temperature,
        key: "temperature",
        unit: "°C",
        display_precision: 1,
    },
    SensorDescription {
        kind: SensorKind::Battery,
        key: "battery",
        unit: "%",
        display_precision: 0,
    },
];

impl SensorKind {
    /// Extract this sensor's value from a reading.
    pub fn value(&self, reading: &Reading) -> Option<f64> {
        match self {
            Self::Pressure => Some(f64::from(reading.pressure_mbar)),
            Self::Temperature => reading.temperature_celsius(),
            Self::Battery => reading.battery_percent().map(f64::from),
        }
    }

    /// Check if the value should be shown as available.
    ///
    /// Battery stays available across disconnects once any value is known,
    /// including a restored one.
    pub fn is_available(&self, reading: &Reading) -> bool {
        match self {
            Self::Pressure | Self::Temperature => reading.connected,
            Self::Battery => reading.battery.is_some(),
        }
    }

    /// Get the description for this sensor.
    pub fn description(&self) -> &'static SensorDescription {
        match self {
            Self::Pressure => &SENSORS[0],
            Self::Temperature => &SENSORS[1],
            Self::Battery => &SENSORS[2],
        }
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description().key)
    }
}
