//! Error types for the pressensor-ble crate.

use thiserror::Error;

/// The main error type for this crate.
///
/// Short or malformed notification payloads are not errors: the decoder
/// drops them and reports an empty update instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The radio could not locate the peripheral.
    #[error("Device not found: {address}")]
    DeviceNotFound {
        /// The address that was searched for.
        address: String,
    },

    /// Establishing the link or the telemetry subscription failed.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// Operation requires a live link but the device is not connected.
    #[error("Device not connected")]
    NotConnected,

    /// The command reached the link but the device rejected it or never
    /// acknowledged it.
    #[error("Command failed: {reason}")]
    CommandFailed {
        /// Description of the failure.
        reason: String,
    },

    /// A radio operation did not complete in time.
    #[error("Timed out during {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// The connection toggle is switched off.
    #[error("Connection is disabled")]
    ConnectionDisabled,

    /// The orchestrator has been shut down.
    #[error("Orchestrator has shut down")]
    ShutDown,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check whether this error means there was no live link.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected)
    }

    /// Check whether a command reached the device and then failed.
    pub fn is_command_failure(&self) -> bool {
        matches!(self, Self::CommandFailed { .. } | Self::Timeout { .. })
    }

    /// Wrap any error raised while establishing a link.
    pub(crate) fn connection_failed(err: impl std::fmt::Display) -> Self {
        Self::ConnectionFailed {
            reason: err.to_string(),
        }
    }

    /// Wrap any error raised while a command was in flight.
    pub(crate) fn command_failed(err: impl std::fmt::Display) -> Self {
        Self::CommandFailed {
            reason: err.to_string(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::DeviceNotFound {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
        };
        assert_eq!(err.to_string(), "Device not found: AA:BB:CC:DD:EE:FF");
        assert_eq!(Error::NotConnected.to_string(), "Device not connected");
    }

    #[test]
    fn test_failure_classes_are_distinct() {
        assert!(Error::NotConnected.is_not_connected());
        assert!(!Error::NotConnected.is_command_failure());

        let err = Error::command_failed("write not acknowledged");
        assert!(err.is_command_failure());
        assert!(!err.is_not_connected());
        assert_eq!(err.to_string(), "Command failed: write not acknowledged");
    }
}
