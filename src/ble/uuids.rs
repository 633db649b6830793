//! BLE Service and Characteristic UUIDs.
//!
//! Contains the UUID constants used for Pressensor communication. The
//! custom values can be overridden through
//! [`Characteristics`](crate::config::Characteristics).

use uuid::Uuid;

// Battery Service (Standard BLE)
/// Standard BLE Battery Service UUID.
pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_00805f9b34fb);
/// Battery Level characteristic UUID (Read, 1 byte percentage).
pub const BATTERY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_2a19_0000_1000_8000_00805f9b34fb);

// Pressure Service (Pressensor Custom)
/// Pressensor pressure service UUID.
pub const PRESSURE_SERVICE_UUID: Uuid = Uuid::from_u128(0x873a_e82a_4c5a_4342_b539_9d900bf7ebd0);
/// Telemetry characteristic UUID (Notify, 2 or 4 bytes big-endian).
pub const PRESSURE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x873a_e82b_4c5a_4342_b539_9d900bf7ebd0);
/// Zero calibration characteristic UUID (Write with response, 1 byte).
pub const ZERO_PRESSURE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x873a_e82c_4c5a_4342_b539_9d900bf7ebd0);

/// Local name prefix advertised by Pressensor transducers.
pub const DEVICE_NAME_PREFIX: &str = "PRS";

/// Check if a service UUID indicates a Pressensor.
pub fn is_pressure_service(uuid: &Uuid) -> bool {
    *uuid == PRESSURE_SERVICE_UUID
}

/// Check if advertised name or services identify a Pressensor.
pub fn is_pressensor_advertisement(local_name: Option<&str>, services: &[Uuid]) -> bool {
    local_name
        .map(|n| n.starts_with(DEVICE_NAME_PREFIX))
        .unwrap_or(false)
        || services.iter().any(is_pressure_service)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        let battery = BATTERY_CHARACTERISTIC_UUID.to_string();
        assert!(battery.contains("2a19"));

        let pressure = PRESSURE_CHARACTERISTIC_UUID.to_string();
        assert!(pressure.starts_with("873ae82b"));
    }

    #[test]
    fn test_characteristics_are_distinct() {
        assert_ne!(PRESSURE_CHARACTERISTIC_UUID, ZERO_PRESSURE_CHARACTERISTIC_UUID);
        assert_ne!(PRESSURE_CHARACTERISTIC_UUID, BATTERY_CHARACTERISTIC_UUID);
    }

    #[test]
    fn test_is_pressensor_advertisement() {
        assert!(is_pressensor_advertisement(Some("PRS12345"), &[]));
        assert!(is_pressensor_advertisement(None, &[PRESSURE_SERVICE_UUID]));
        assert!(!is_pressensor_advertisement(Some("LUNAR-1A2B"), &[BATTERY_SERVICE_UUID]));
        assert!(!is_pressensor_advertisement(None, &[]));
    }
}
