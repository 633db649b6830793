//! Diagnostics snapshot for support dumps.

use chrono::{DateTime, Utc};

use crate::data::Reading;
use crate::session::SessionState;
use crate::utils::REDACTED;

/// Point-in-time view of the orchestrator's bookkeeping.
///
/// The device address is redacted so the snapshot can be shared.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Diagnostics {
    /// Device address, always redacted.
    pub address: String,
    /// Latest published reading.
    pub reading: Reading,
    /// State of the session, if one has been created.
    pub session_state: Option<SessionState>,
    /// Whether a connection attempt is in flight.
    pub connecting: bool,
    /// Whether the device was reachable the last time we looked.
    pub was_available: bool,
    /// Whether the connection toggle is on.
    pub connection_enabled: bool,
    /// When the battery was last confirmed, by a read or a full connect.
    pub last_battery_check: Option<DateTime<Utc>>,
    /// Consecutive failed battery maintenance checks.
    pub maintenance_failures: u32,
}

impl Diagnostics {
    pub(crate) fn redacted_address() -> String {
        REDACTED.to_string()
    }

    /// Check if maintenance keeps failing while the device is offline,
    /// which usually means a flat battery.
    pub fn battery_maybe_depleted(&self) -> bool {
        self.maintenance_failures > 0 && !self.reading.connected
    }
}
