//! Configuration for sessions, the orchestrator and the btleplug radio.

use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::ble::uuids::{
    BATTERY_CHARACTERISTIC_UUID, PRESSURE_CHARACTERISTIC_UUID, ZERO_PRESSURE_CHARACTERISTIC_UUID,
};

/// Default dead-band in millibar. Pressure changes must be strictly larger.
pub const DEFAULT_DEAD_BAND_MBAR: i32 = 5;

/// GATT characteristics used by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Characteristics {
    /// Telemetry notify characteristic.
    pub telemetry: Uuid,
    /// Battery level read characteristic.
    pub battery: Uuid,
    /// Zero calibration write characteristic.
    pub calibration: Uuid,
}

impl Default for Characteristics {
    fn default() -> Self {
        Self {
            telemetry: PRESSURE_CHARACTERISTIC_UUID,
            battery: BATTERY_CHARACTERISTIC_UUID,
            calibration: ZERO_PRESSURE_CHARACTERISTIC_UUID,
        }
    }
}

/// Per-session settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionConfig {
    /// Characteristics to subscribe, read and write.
    pub characteristics: Characteristics,
    /// Timeout applied to each radio step (connect, subscribe, read, write).
    pub operation_timeout: Duration,
    /// Dead-band for pressure updates in millibar.
    pub dead_band_mbar: i32,
    /// Battery level restored from a previous run, reported as stale until
    /// a live read replaces it.
    pub battery_seed: Option<u8>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            characteristics: Characteristics::default(),
            operation_timeout: Duration::from_secs(30),
            dead_band_mbar: DEFAULT_DEAD_BAND_MBAR,
            battery_seed: None,
        }
    }
}

/// Settings for the reconnection orchestrator.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct OrchestratorConfig {
    /// Backstop timer in case an advertisement was missed.
    pub fallback_interval: Duration,
    /// Cadence of the battery maintenance check.
    pub maintenance_interval: Duration,
    /// Make one opportunistic connection attempt right after start.
    pub connect_on_start: bool,
    /// Settings handed to the session.
    pub session: SessionConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fallback_interval: Duration::from_secs(5 * 60),
            maintenance_interval: Duration::from_secs(24 * 60 * 60),
            connect_on_start: true,
            session: SessionConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Set the fallback reconnection interval.
    pub fn with_fallback_interval(mut self, interval: Duration) -> Self {
        self.fallback_interval = interval;
        self
    }

    /// Set the battery maintenance interval.
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Enable or disable the connection attempt at start.
    pub fn with_connect_on_start(mut self, connect: bool) -> Self {
        self.connect_on_start = connect;
        self
    }

    /// Set the per-operation radio timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.session.operation_timeout = timeout;
        self
    }

    /// Set the pressure dead-band.
    pub fn with_dead_band(mut self, mbar: i32) -> Self {
        self.session.dead_band_mbar = mbar;
        self
    }

    /// Seed the battery level with a value remembered from a previous run.
    pub fn with_battery_seed(mut self, percent: u8) -> Self {
        self.session.battery_seed = Some(percent.min(100));
        self
    }

    /// Override the characteristic UUIDs.
    pub fn with_characteristics(mut self, characteristics: Characteristics) -> Self {
        self.session.characteristics = characteristics;
        self
    }

    /// Replace zero durations, which would stall or panic the timers, with
    /// the defaults.
    pub(crate) fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.fallback_interval.is_zero() {
            warn!("Fallback interval must not be zero, using {:?}", defaults.fallback_interval);
            self.fallback_interval = defaults.fallback_interval;
        }
        if self.maintenance_interval.is_zero() {
            warn!(
                "Maintenance interval must not be zero, using {:?}",
                defaults.maintenance_interval
            );
            self.maintenance_interval = defaults.maintenance_interval;
        }
        if self.session.operation_timeout.is_zero() {
            warn!(
                "Operation timeout must not be zero, using {:?}",
                defaults.session.operation_timeout
            );
            self.session.operation_timeout = defaults.session.operation_timeout;
        }
        self
    }
}

/// Settings for the btleplug radio backend.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BtleplugConfig {
    /// Connection attempts per `connect_with_retry` call.
    pub max_connect_attempts: u32,
    /// Delay between connection attempts.
    pub retry_delay: Duration,
}

impl Default for BtleplugConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}
