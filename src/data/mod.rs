//! Data structures for device state.
//!
//! This module contains the snapshot types handed to consumers and the
//! sensor descriptions presentation layers build on.

pub mod reading;
pub mod sensors;

pub use reading::{BatteryLevel, PartialReading, Reading};
pub use sensors::{SensorDescription, SensorKind, SENSORS};
