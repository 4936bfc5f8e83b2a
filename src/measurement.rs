//! Decoded RAPT Pill reading.

use crate::advertisement::MacAddress;
use serde::Serialize;

/// Raw accelerometer reading, informational only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Accelerometer {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// An uncalibrated reading decoded from one advertisement.
///
/// Calibration is left to consumers. Values are normalized:
/// - Temperature in Celsius, whatever unit the beacon sent
/// - Specific gravity as a ratio (1.000 is water)
/// - Battery in percent
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    /// Payload format discriminator, selects the temperature unit on the wire
    pub format_version: u8,
    /// Temperature in Celsius
    pub temperature_celsius_uncalibrated: f64,
    /// Specific gravity
    pub specific_gravity_uncalibrated: f64,
    /// Battery charge in percent, when the payload carries it
    pub battery_percent: Option<f64>,
    /// Accelerometer vector, when the payload carries it
    pub accelerometer: Option<Accelerometer>,
    /// Human-readable beacon color, selects the publish topic
    pub color: String,
}

impl MeasurementRecord {
    pub fn temperature_fahrenheit_uncalibrated(&self) -> f64 {
        self.temperature_celsius_uncalibrated * 9.0 / 5.0 + 32.0
    }
}

/// A decoded record together with where it was heard from.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub record: MeasurementRecord,
    pub address: MacAddress,
    pub rssi: Option<i16>,
}
