//! Protocol module for parsing notifications and constructing commands.
//!
//! This module contains the implementations for:
//! - Telemetry notification parsing with rounding and dead-band filtering
//! - Battery level decoding
//! - Zero calibration command encoding

pub mod commands;
pub mod telemetry;

pub use commands::{decode_battery, encode_zero_command};
pub use telemetry::{TelemetryDecoder, TelemetryFrame, PRESSURE_RESOLUTION_MBAR};
