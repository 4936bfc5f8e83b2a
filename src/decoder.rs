//! Decoding of RAPT Pill manufacturer data.
//!
//! The payload (company identifier already stripped) is a fixed-offset record:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 1 | format version (`1` = °F, `2` = °C) |
//! | 1 | 2 | temperature, signed big-endian tenths of a degree |
//! | 3 | 2 | gravity, unsigned big-endian SG × 1000 |
//! | 5 | 2 | battery, unsigned big-endian percent × 256 (optional) |
//! | 7 | 6 | accelerometer x/y/z, signed big-endian × 16 (optional) |
//!
//! Only temperature and gravity are required. Trailing fields that do not fit
//! in the payload decode to `None`.

use crate::advertisement::{RawAdvertisement, hex};
use crate::color::ColorTable;
use crate::measurement::{Accelerometer, MeasurementRecord};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Company identifier the RAPT Pill broadcasts its readings under.
///
/// On air this is the byte pair `52 41` ("RA"), little-endian.
pub const RAPT_VENDOR_ID: u16 = 0x4152;

/// Format version whose temperature is tenths of a degree Fahrenheit.
pub const FORMAT_FAHRENHEIT: u8 = 1;

/// Format version whose temperature is tenths of a degree Celsius.
pub const FORMAT_CELSIUS: u8 = 2;

/// Shortest payload holding version, temperature and gravity.
pub const MIN_PAYLOAD_LEN: usize = 5;

const BATTERY_OFFSET: usize = 5;
const ACCELEROMETER_OFFSET: usize = 7;

/// Specific gravity outside this window is treated as garbage.
pub const GRAVITY_RANGE: std::ops::RangeInclusive<f64> = 0.5..=2.0;

/// Reasons an advertisement could not be turned into a reading.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("unsupported vendor 0x{0:04X}")]
    UnsupportedVendor(u16),
    #[error("payload too short: {len} bytes")]
    Truncated { len: usize },
    #[error("unknown format version {version} (payload {payload})")]
    UnknownFormatVersion { version: u8, payload: String },
    #[error("implausible specific gravity {gravity:.3} (payload {payload})")]
    ImplausibleGravity { gravity: f64, payload: String },
    #[error("no color known for service UUIDs {uuids:?}")]
    UnknownDeviceColor { uuids: Vec<Uuid> },
    #[error("advertisement matches several colors: {colors:?}")]
    AmbiguousDeviceColor { colors: Vec<String> },
}

/// Decode a RAPT Pill payload into a [`MeasurementRecord`].
///
/// # Arguments
/// * `vendor_id` - Company identifier of the manufacturer data
/// * `payload` - Manufacturer data bytes, company identifier stripped
/// * `service_uuids` - Service UUIDs from the same advertisement, used for the color
/// * `colors` - Color lookup table
///
/// # Unit Conversions
/// - Temperature: tenths of °F or °C → °C
/// - Gravity: SG × 1000 → SG
/// - Battery: percent × 256 → percent
/// - Accelerometer: raw × 16 → raw
pub fn decode(
    vendor_id: u16,
    payload: &[u8],
    service_uuids: &[Uuid],
    colors: &ColorTable,
) -> Result<MeasurementRecord, DecodeError> {
    if vendor_id != RAPT_VENDOR_ID {
        return Err(DecodeError::UnsupportedVendor(vendor_id));
    }
    if payload.len() < MIN_PAYLOAD_LEN {
        return Err(DecodeError::Truncated { len: payload.len() });
    }

    let format_version = payload[0];
    let temperature_raw = f64::from(i16::from_be_bytes([payload[1], payload[2]]));
    let temperature_celsius_uncalibrated = match format_version {
        FORMAT_FAHRENHEIT => (temperature_raw / 10.0 - 32.0) * 5.0 / 9.0,
        FORMAT_CELSIUS => temperature_raw / 10.0,
        version => {
            return Err(DecodeError::UnknownFormatVersion {
                version,
                payload: hex(payload),
            });
        }
    };

    let gravity = f64::from(u16::from_be_bytes([payload[3], payload[4]])) / 1000.0;
    if !GRAVITY_RANGE.contains(&gravity) {
        return Err(DecodeError::ImplausibleGravity {
            gravity,
            payload: hex(payload),
        });
    }

    let battery_percent = be_u16(payload, BATTERY_OFFSET).map(|raw| f64::from(raw) / 256.0);

    let accelerometer = match (
        be_i16(payload, ACCELEROMETER_OFFSET),
        be_i16(payload, ACCELEROMETER_OFFSET + 2),
        be_i16(payload, ACCELEROMETER_OFFSET + 4),
    ) {
        (Some(x), Some(y), Some(z)) => Some(Accelerometer {
            x: f64::from(x) / 16.0,
            y: f64::from(y) / 16.0,
            z: f64::from(z) / 16.0,
        }),
        _ => None,
    };

    let color = resolve_color(service_uuids, colors)?;

    Ok(MeasurementRecord {
        format_version,
        temperature_celsius_uncalibrated,
        specific_gravity_uncalibrated: gravity,
        battery_percent,
        accelerometer,
        color,
    })
}

/// Find the single color named by the advertisement's service UUIDs.
fn resolve_color(service_uuids: &[Uuid], colors: &ColorTable) -> Result<String, DecodeError> {
    let mut matched: Vec<&str> = service_uuids.iter().filter_map(|u| colors.get(u)).collect();
    matched.sort_unstable();
    matched.dedup();

    match matched.as_slice() {
        [] => Err(DecodeError::UnknownDeviceColor {
            uuids: service_uuids.to_vec(),
        }),
        [color] => Ok((*color).to_string()),
        many => Err(DecodeError::AmbiguousDeviceColor {
            colors: many.iter().map(|c| c.to_string()).collect(),
        }),
    }
}

fn be_u16(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn be_i16(data: &[u8], offset: usize) -> Option<i16> {
    data.get(offset..offset + 2)
        .map(|b| i16::from_be_bytes([b[0], b[1]]))
}

/// Decoder bound to a shared color table.
#[derive(Debug, Clone)]
pub struct PayloadDecoder {
    colors: Arc<ColorTable>,
}

impl PayloadDecoder {
    pub fn new(colors: Arc<ColorTable>) -> Self {
        Self { colors }
    }

    pub fn decode(&self, advertisement: &RawAdvertisement) -> Result<MeasurementRecord, DecodeError> {
        decode(
            advertisement.vendor_id,
            &advertisement.payload,
            &advertisement.service_uuids,
            &self.colors,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ORANGE_UUID, payload};

    fn colors() -> ColorTable {
        ColorTable::builtin()
    }

    fn decode_ok(bytes: &[u8]) -> MeasurementRecord {
        decode(RAPT_VENDOR_ID, bytes, &[ORANGE_UUID], &colors()).unwrap()
    }

    #[test]
    fn test_decode_fahrenheit_scenario() {
        let record = decode_ok(&[0x01, 0x02, 0x9E, 0x04, 0x18]);
        assert_eq!(record.format_version, 1);
        assert!((record.temperature_celsius_uncalibrated - 19.444_444).abs() < 1e-5);
        assert_eq!(record.specific_gravity_uncalibrated, 1.048);
        assert_eq!(record.color, "Orange");
        assert_eq!(record.battery_percent, None);
        assert_eq!(record.accelerometer, None);
    }

    #[test]
    fn test_decode_fahrenheit_formula() {
        for raw in [-400i16, 0, 320, 670, 1000, 2120] {
            let record = decode_ok(&payload(FORMAT_FAHRENHEIT, raw, 1010));
            let expected = (f64::from(raw) / 10.0 - 32.0) * 5.0 / 9.0;
            assert!(
                (record.temperature_celsius_uncalibrated - expected).abs() < 1e-6,
                "raw {raw}"
            );
        }
    }

    #[test]
    fn test_decode_celsius_formula() {
        for raw in [-55i16, 0, 185, 210, 999] {
            let record = decode_ok(&payload(FORMAT_CELSIUS, raw, 1010));
            let expected = f64::from(raw) / 10.0;
            assert!((record.temperature_celsius_uncalibrated - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_decode_gravity_1050() {
        let record = decode_ok(&payload(FORMAT_CELSIUS, 200, 1050));
        assert_eq!(record.specific_gravity_uncalibrated, 1.050);
    }

    #[test]
    fn test_decode_gravity_bounds_inclusive() {
        assert_eq!(
            decode_ok(&payload(FORMAT_CELSIUS, 200, 500)).specific_gravity_uncalibrated,
            0.5
        );
        assert_eq!(
            decode_ok(&payload(FORMAT_CELSIUS, 200, 2000)).specific_gravity_uncalibrated,
            2.0
        );
    }

    #[test]
    fn test_decode_implausible_gravity() {
        for raw in [0u16, 1, 499, 2001, 0xFFFF] {
            let result = decode(
                RAPT_VENDOR_ID,
                &payload(FORMAT_CELSIUS, 200, raw),
                &[ORANGE_UUID],
                &colors(),
            );
            assert!(
                matches!(result, Err(DecodeError::ImplausibleGravity { .. })),
                "raw {raw}: {result:?}"
            );
        }
    }

    #[test]
    fn test_decode_unknown_format_version() {
        for version in [0u8, 3, 0x64, 0xFF] {
            let result = decode(
                RAPT_VENDOR_ID,
                &payload(version, 200, 1010),
                &[ORANGE_UUID],
                &colors(),
            );
            assert!(matches!(
                result,
                Err(DecodeError::UnknownFormatVersion { version: v, .. }) if v == version
            ));
        }
    }

    #[test]
    fn test_decode_unsupported_vendor() {
        let result = decode(0x0499, &payload(FORMAT_CELSIUS, 200, 1010), &[ORANGE_UUID], &colors());
        assert_eq!(result, Err(DecodeError::UnsupportedVendor(0x0499)));
    }

    #[test]
    fn test_decode_truncated() {
        let result = decode(RAPT_VENDOR_ID, &[0x01, 0x02, 0x9E, 0x04], &[ORANGE_UUID], &colors());
        assert_eq!(result, Err(DecodeError::Truncated { len: 4 }));
    }

    #[test]
    fn test_decode_half_battery_field() {
        let mut bytes = payload(FORMAT_CELSIUS, 200, 1010);
        bytes.push(0x5A);
        assert_eq!(bytes.len(), 6);
        let record = decode_ok(&bytes);
        assert_eq!(record.battery_percent, None);
        assert_eq!(record.accelerometer, None);
        assert_eq!(record.specific_gravity_uncalibrated, 1.01);
    }

    #[test]
    fn test_decode_optional_trailing_fields() {
        let mut bytes = payload(FORMAT_CELSIUS, 200, 1010);
        bytes.extend_from_slice(&[0x5A, 0x00]); // 90%
        let record = decode_ok(&bytes);
        assert_eq!(record.battery_percent, Some(90.0));
        assert_eq!(record.accelerometer, None);

        // x = 16 (1.0), y = -32 (-2.0), z = 0x0100 (16.0)
        bytes.extend_from_slice(&[0x00, 0x10, 0xFF, 0xE0, 0x01, 0x00]);
        let record = decode_ok(&bytes);
        assert_eq!(
            record.accelerometer,
            Some(Accelerometer {
                x: 1.0,
                y: -2.0,
                z: 16.0
            })
        );

        // a partial accelerometer is dropped whole
        bytes.pop();
        assert_eq!(decode_ok(&bytes).accelerometer, None);
    }

    #[test]
    fn test_decode_unknown_color() {
        let result = decode(
            RAPT_VENDOR_ID,
            &payload(FORMAT_CELSIUS, 200, 1010),
            &[Uuid::nil()],
            &colors(),
        );
        assert_eq!(
            result,
            Err(DecodeError::UnknownDeviceColor {
                uuids: vec![Uuid::nil()]
            })
        );

        let result = decode(RAPT_VENDOR_ID, &payload(FORMAT_CELSIUS, 200, 1010), &[], &colors());
        assert!(matches!(result, Err(DecodeError::UnknownDeviceColor { .. })));
    }

    #[test]
    fn test_decode_ambiguous_color() {
        let red = uuid::uuid!("a495bb10-c5b1-4b44-b512-1370f02d74de");
        let result = decode(
            RAPT_VENDOR_ID,
            &payload(FORMAT_CELSIUS, 200, 1010),
            &[ORANGE_UUID, red],
            &colors(),
        );
        assert!(matches!(result, Err(DecodeError::AmbiguousDeviceColor { .. })));

        // the same color listed twice is fine
        let record = decode(
            RAPT_VENDOR_ID,
            &payload(FORMAT_CELSIUS, 200, 1010),
            &[ORANGE_UUID, ORANGE_UUID],
            &colors(),
        )
        .unwrap();
        assert_eq!(record.color, "Orange");
    }

    #[test]
    fn test_decode_is_deterministic() {
        let mut bytes = payload(FORMAT_FAHRENHEIT, 670, 1048);
        bytes.extend_from_slice(&[0x40, 0x80, 0x00, 0x10, 0x00, 0x20, 0x00, 0x30]);
        let first = decode_ok(&bytes);
        let second = decode_ok(&bytes);
        assert_eq!(first, second);
        assert_eq!(
            first.temperature_celsius_uncalibrated.to_bits(),
            second.temperature_celsius_uncalibrated.to_bits()
        );
    }

    #[test]
    fn test_payload_decoder_uses_advertisement() {
        let decoder = PayloadDecoder::new(Arc::new(colors()));
        let adv = crate::test_utils::advertisement(payload(FORMAT_CELSIUS, 185, 1012));
        let record = decoder.decode(&adv).unwrap();
        assert_eq!(record.color, "Orange");
        assert!((record.temperature_celsius_uncalibrated - 18.5).abs() < 1e-9);
    }

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::UnknownFormatVersion {
            version: 7,
            payload: "07".to_string(),
        };
        assert_eq!(err.to_string(), "unknown format version 7 (payload 07)");
        assert_eq!(
            DecodeError::UnsupportedVendor(0x0499).to_string(),
            "unsupported vendor 0x0499"
        );
    }
}
