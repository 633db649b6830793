// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # pressensor-ble
//!
//! A Rust library for keeping a live Bluetooth Low Energy session with a
//! Pressensor PRS pressure transducer.
//!
//! The transducer sleeps most of the time and only advertises when it has
//! something to report. This library reconnects opportunistically, decodes
//! its telemetry into immutable [`Reading`] snapshots and keeps the battery
//! level fresh even when the device is rarely seen.
//!
//! ## Features
//!
//! - **Telemetry decoding**: Pressure rounded to 10 mbar with a noise
//!   dead-band, temperature in 0.1 °C
//! - **Reconnection**: Advertisement-driven with a fallback timer, never more
//!   than one attempt in flight
//! - **Battery maintenance**: Daily battery check, flagging a device that
//!   stays unreachable
//! - **Zero calibration**: Acknowledged write with distinct failure modes
//! - **Pluggable radio**: btleplug backend, or any [`Radio`] implementation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pressensor_ble::{BtleplugRadio, Orchestrator, OrchestratorConfig, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let radio = Arc::new(BtleplugRadio::new().await?);
//!     let orchestrator =
//!         Orchestrator::start(radio, "AA:BB:CC:DD:EE:FF", OrchestratorConfig::default());
//!
//!     let _handle = orchestrator.subscribe_to_updates(|reading| {
//!         println!("{} mbar (connected: {})", reading.pressure_mbar, reading.connected);
//!     });
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     orchestrator.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Addresses are hidden by the OS; use the
//! identifier returned by [`BtleplugRadio::discover`] instead.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization for configuration, readings and diagnostics

// Public modules
pub mod ble;
pub mod config;
pub mod data;
pub mod diagnostics;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod session;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use ble::platform::BtleplugRadio;
pub use ble::radio::{Link, LinkEvent, LinkEventKind, LinkEventSink, PeripheralHandle, Radio};
pub use ble::scanner::DiscoveredDevice;
pub use config::{BtleplugConfig, Characteristics, OrchestratorConfig, SessionConfig};
pub use data::{BatteryLevel, PartialReading, Reading, SensorDescription, SensorKind, SENSORS};
pub use diagnostics::Diagnostics;
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
pub use session::{CallbackHandle, ConnectionSession, SessionState};
pub use utils::{format_mac, round_half_even};
