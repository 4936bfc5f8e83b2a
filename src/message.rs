//! Outbound JSON message and topic naming.
//!
//! Field names are a contract with subscribers (automation platforms bind to
//! them) and must not change.

use crate::measurement::{Accelerometer, Reading};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Default topic prefix, `<namespace>/<device-family>`.
pub const DEFAULT_TOPIC_PREFIX: &str = "rapt/pill";

/// JSON projection of a [`Reading`], stamped with the time it was published.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub temperature_celsius_uncalibrated: f64,
    pub temperature_fahrenheit_uncalibrated: f64,
    pub specific_gravity_uncalibrated: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accelerometer: Option<Accelerometer>,
    pub format_version: u8,
    pub color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,
    pub address: String,
    /// RFC 3339, UTC
    pub timestamp: String,
}

impl OutboundMessage {
    pub fn new(reading: &Reading, timestamp: OffsetDateTime) -> Result<Self, time::error::Format> {
        let record = &reading.record;
        Ok(Self {
            temperature_celsius_uncalibrated: record.temperature_celsius_uncalibrated,
            temperature_fahrenheit_uncalibrated: record.temperature_fahrenheit_uncalibrated(),
            specific_gravity_uncalibrated: record.specific_gravity_uncalibrated,
            battery_percent: record.battery_percent,
            accelerometer: record.accelerometer,
            format_version: record.format_version,
            color: record.color.clone(),
            rssi: reading.rssi,
            address: reading.address.to_string(),
            timestamp: timestamp.format(&Rfc3339)?,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Topic a beacon of `color` publishes to, e.g. `rapt/pill/Orange`.
pub fn topic(prefix: &str, color: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let color = sanitize_topic_segment(color);
    if prefix.is_empty() {
        color
    } else {
        format!("{prefix}/{color}")
    }
}

/// MQTT topic levels cannot contain the `#`/`+` wildcards or the level separator.
fn sanitize_topic_segment(s: &str) -> String {
    s.replace(['#', '+', ' ', '/'], "_")
}
