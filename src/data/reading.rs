//! Reading snapshot data structures.
//!
//! A [`Reading`] is an immutable copy of everything known about the device.
//! Updates never mutate a published reading; they produce a new one.

/// Battery level together with where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BatteryLevel {
    /// Charge in percent (0-100).
    pub percent: u8,
    /// `true` once read from the device in this run, `false` for a value
    /// restored from a previous run.
    pub live: bool,
}

/// Snapshot of the device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Reading {
    /// Pressure in millibar, rounded to 10 mbar.
    pub pressure_mbar: i32,
    /// Temperature in tenths of a degree Celsius.
    pub temperature_decicelsius: Option<i16>,
    /// Battery level, if known.
    pub battery: Option<BatteryLevel>,
    /// Whether a live link with an active subscription exists.
    pub connected: bool,
}

impl Reading {
    /// Create an empty reading seeded with a restored battery level.
    pub fn seeded(battery_percent: Option<u8>) -> Self {
        Self {
            battery: battery_percent.map(|percent| BatteryLevel {
                percent: percent.min(100),
                live: false,
            }),
            ..Self::default()
        }
    }

    /// Get the temperature in degrees Celsius.
    pub fn temperature_celsius(&self) -> Option<f64> {
        self.temperature_decicelsius.map(|t| f64::from(t) / 10.0)
    }

    /// Get the battery percentage, live or restored.
    pub fn battery_percent(&self) -> Option<u8> {
        self.battery.map(|b| b.percent)
    }

    /// Check if the battery value was read from the device in this run.
    pub fn battery_is_live(&self) -> bool {
        self.battery.map(|b| b.live).unwrap_or(false)
    }

    /// Produce a new reading with a decoded update applied.
    pub fn apply(&self, update: &PartialReading) -> Self {
        let mut next = *self;
        if let Some(pressure) = update.pressure_mbar {
            next.pressure_mbar = pressure;
        }
        if let Some(temperature) = update.temperature_decicelsius {
            next.temperature_decicelsius = Some(temperature);
        }
        if update.now_connected {
            next.connected = true;
        }
        next
    }

    /// Produce a new reading with the connected flag set.
    pub fn with_connected(&self, connected: bool) -> Self {
        Self { connected, ..*self }
    }

    /// Produce a new reading with a live battery value.
    pub fn with_live_battery(&self, percent: u8) -> Self {
        Self {
            battery: Some(BatteryLevel {
                percent,
                live: true,
            }),
            ..*self
        }
    }
}

/// Per-field changes decoded from one notification.
///
/// A field is `Some` only when it changed. An empty update means nothing
/// needs to be published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartialReading {
    /// New pressure in millibar, if it passed the dead-band.
    pub pressure_mbar: Option<i32>,
    /// New temperature in tenths of a degree, if it differs.
    pub temperature_decicelsius: Option<i16>,
    /// Set on the first notification after the link came up.
    pub now_connected: bool,
}

impl PartialReading {
    /// Check if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.pressure_mbar.is_none() && self.temperature_decicelsius.is_none() && !self.now_connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_reading() {
        let reading = Reading::default();
        assert_eq!(reading.pressure_mbar, 0);
        assert_eq!(reading.temperature_celsius(), None);
        assert_eq!(reading.battery_percent(), None);
        assert!(!reading.connected);
    }

    #[test]
    fn test_seeded_battery_is_stale() {
        let reading = Reading::seeded(Some(80));
        assert_eq!(reading.battery_percent(), Some(80));
        assert!(!reading.battery_is_live());

        let live = reading.with_live_battery(79);
        assert_eq!(live.battery_percent(), Some(79));
        assert!(live.battery_is_live());
        // The original snapshot is untouched.
        assert!(!reading.battery_is_live());
    }

    #[test]
    fn test_apply_partial_reading() {
        let reading = Reading::default();
        let update = PartialReading {
            pressure_mbar: Some(1050),
            temperature_decicelsius: Some(935),
            now_connected: true,
        };

        let next = reading.apply(&update);
        assert_eq!(
            next,
            Reading {
                pressure_mbar: 1050,
                temperature_decicelsius: Some(935),
                battery: None,
                connected: true,
            }
        );
        assert_eq!(next.temperature_celsius(), Some(93.5));
    }

    #[test]
    fn test_apply_empty_update_is_identity() {
        let reading = Reading {
            pressure_mbar: 2000,
            ..Reading::default()
        };
        let update = PartialReading::default();
        assert!(update.is_empty());
        assert_eq!(reading.apply(&update), reading);
    }
}
