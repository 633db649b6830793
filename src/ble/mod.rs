//! BLE communication module.
//!
//! This module provides the radio abstraction used by sessions and the
//! orchestrator, plus its btleplug implementation.

pub mod characteristics;
pub mod connection;
pub mod platform;
pub mod radio;
pub mod scanner;
pub mod uuids;

pub use characteristics::BtleplugLink;
pub use platform::BtleplugRadio;
pub use radio::{Link, LinkEvent, LinkEventKind, LinkEventSink, PeripheralHandle, Radio};
pub use scanner::{BleScanner, BtleplugPeripheral, DiscoveredDevice};
pub use uuids::*;
