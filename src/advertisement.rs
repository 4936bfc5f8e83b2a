//! Raw BLE advertisement frames as delivered by a scanner backend.

use std::fmt;
use uuid::Uuid;

/// A Bluetooth device address stored as a compact 6-byte array.
///
/// Only used for logging and in the outbound message; beacons are told apart
/// by color, never by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

/// One manufacturer-data entry observed in a single broadcast.
///
/// Produced once per observed beacon broadcast and consumed immediately by
/// the scan cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAdvertisement {
    /// Address of the broadcasting device
    pub address: MacAddress,
    /// Bluetooth SIG company identifier of the manufacturer data
    pub vendor_id: u16,
    /// Manufacturer data bytes, company identifier stripped
    pub payload: Vec<u8>,
    /// 128-bit service UUIDs carried in the same advertisement
    pub service_uuids: Vec<Uuid>,
    /// Received signal strength in dBm
    pub rssi: Option<i16>,
}

impl RawAdvertisement {
    /// Lowercase hex rendering of the payload for diagnostics.
    pub fn payload_hex(&self) -> String {
        hex(&self.payload)
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
