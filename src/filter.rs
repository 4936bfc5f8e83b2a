//! Cheap pre-decode classification of advertisements.
//!
//! Scanning picks up every BLE device in range. Only frames carrying the RAPT
//! vendor identifier and enough bytes for the required fields are passed to
//! the decoder; everything else is dropped without an error.

use crate::advertisement::RawAdvertisement;
use crate::decoder::{MIN_PAYLOAD_LEN, RAPT_VENDOR_ID};

/// Company identifier used for firmware-version announcements ("KE" on air).
pub const FIRMWARE_VENDOR_ID: u16 = 0x454B;

/// Leading payload byte of a firmware-version announcement.
const FIRMWARE_MARKER: u8 = b'G';

/// Leading payload bytes of a device-type announcement, sent under the RAPT
/// vendor identifier.
const DEVICE_TYPE_MARKER: &[u8] = b"PTd";

/// Informational frame broadcast between readings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    /// Firmware version string
    Firmware(String),
    /// Device type string, e.g. the hardware model
    DeviceType(String),
}

/// Returns `true` when the advertisement looks like a RAPT Pill reading.
pub fn accepts(advertisement: &RawAdvertisement) -> bool {
    advertisement.vendor_id == RAPT_VENDOR_ID && advertisement.payload.len() >= MIN_PAYLOAD_LEN
}

/// Recognize firmware-version and device-type announcements.
pub fn announcement(advertisement: &RawAdvertisement) -> Option<Announcement> {
    let payload = advertisement.payload.as_slice();
    match advertisement.vendor_id {
        FIRMWARE_VENDOR_ID => match payload.split_first() {
            Some((&FIRMWARE_MARKER, version)) if !version.is_empty() => {
                Some(Announcement::Firmware(ascii_field(version)))
            }
            _ => None,
        },
        RAPT_VENDOR_ID => match payload.strip_prefix(DEVICE_TYPE_MARKER) {
            Some(device_type) if !device_type.is_empty() => {
                Some(Announcement::DeviceType(ascii_field(device_type)))
            }
            _ => None,
        },
        _ => None,
    }
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string()
}
