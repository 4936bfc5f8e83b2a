//! Raw HCI socket backend.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.

use super::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, Radio, ScanError};
use crate::advertisement::{MacAddress, RawAdvertisement};
use futures::future::BoxFuture;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const HCI_FILTER: c_int = 2;
const SOL_HCI: c_int = 0;

// HCI packet types
const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Scan parameters
const LE_SCAN_PASSIVE: u8 = 0x00;
const LE_PUBLIC_ADDRESS: u8 = 0x00;
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;
// 10ms in 0.625ms units
const SCAN_INTERVAL: u16 = 0x0010;
const SCAN_WINDOW: u16 = 0x0010;

// AD types
const AD_TYPE_INCOMPLETE_UUID128: u8 = 0x06;
const AD_TYPE_COMPLETE_UUID128: u8 = 0x07;
const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// LE Set Scan Parameters command parameters
fn scan_parameters() -> Vec<u8> {
    let mut params = Vec::with_capacity(7);
    params.push(LE_SCAN_PASSIVE);
    params.extend_from_slice(&SCAN_INTERVAL.to_le_bytes());
    params.extend_from_slice(&SCAN_WINDOW.to_le_bytes());
    params.push(LE_PUBLIC_ADDRESS);
    params.push(FILTER_POLICY_ACCEPT_ALL);
    params
}

/// LE Set Scan Enable command packet. Duplicates are never filtered.
fn scan_enable_packet(enable: bool) -> Vec<u8> {
    hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[u8::from(enable), 0x00])
}

fn os_error(context: &str) -> ScanError {
    ScanError::Bluetooth(format!("{context}: {}", io::Error::last_os_error()))
}

/// Open a raw, non-blocking HCI socket bound to `dev_id`
fn open_hci_socket(dev_id: u16) -> Result<OwnedFd, ScanError> {
    // nix doesn't support BTPROTO_HCI, so libc is used directly.
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };
    if fd < 0 {
        return Err(os_error("Failed to create HCI socket"));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: 0, // HCI_CHANNEL_RAW
    };
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };
    if ret < 0 {
        return Err(os_error("Failed to bind HCI socket"));
    }

    Ok(fd)
}

/// Restrict a socket to LE meta events
fn set_hci_filter(fd: &OwnedFd) -> Result<(), ScanError> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_HCI,
            HCI_FILTER,
            &filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };
    if ret < 0 {
        return Err(os_error("Failed to set HCI filter"));
    }

    Ok(())
}

/// Send an HCI command
fn send_hci_command(fd: &OwnedFd, packet: &[u8]) -> Result<(), ScanError> {
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };
    if ret < 0 {
        return Err(os_error("Failed to send HCI command"));
    }
    Ok(())
}

/// Parse an HCI LE advertising report event.
///
/// `data` is the whole HCI packet starting at the packet type byte. Only the
/// first report of the event is read. Returns one advertisement per
/// manufacturer-data AD structure.
fn parse_advertising_report(data: &[u8]) -> Vec<RawAdvertisement> {
    // packet type, event code, parameter length, subevent
    if data.len() < 4
        || data[0] != HCI_EVENT_PKT
        || data[1] != EVT_LE_META_EVENT
        || data[3] != EVT_LE_ADVERTISING_REPORT
    {
        return Vec::new();
    }
    let report = &data[4..];

    // num_reports(1) + event_type(1) + addr_type(1) + addr(6) + data_len(1)
    if report.len() < 10 || report[0] == 0 {
        return Vec::new();
    }

    let mut addr = [0u8; 6];
    addr.copy_from_slice(&report[3..9]);
    addr.reverse(); // HCI uses little-endian address

    let data_len = report[9] as usize;
    let Some(ad_data) = report.get(10..10 + data_len) else {
        return Vec::new();
    };
    let rssi = report.get(10 + data_len).map(|&b| i16::from(b as i8));

    let mut manufacturer: Vec<(u16, &[u8])> = Vec::new();
    let mut service_uuids = Vec::new();

    let mut offset = 0;
    while offset + 2 <= ad_data.len() {
        let len = ad_data[offset] as usize;
        if len == 0 || offset + 1 + len > ad_data.len() {
            break;
        }
        let ad_type = ad_data[offset + 1];
        let value = &ad_data[offset + 2..offset + 1 + len];

        match ad_type {
            AD_TYPE_MANUFACTURER_DATA if value.len() >= 2 => {
                let vendor_id = u16::from_le_bytes([value[0], value[1]]);
                manufacturer.push((vendor_id, &value[2..]));
            }
            AD_TYPE_INCOMPLETE_UUID128 | AD_TYPE_COMPLETE_UUID128 => {
                for chunk in value.chunks_exact(16) {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(chunk);
                    bytes.reverse(); // little-endian on air
                    service_uuids.push(Uuid::from_bytes(bytes));
                }
            }
            _ => {}
        }

        offset += 1 + len;
    }

    service_uuids.sort();
    let address = MacAddress(addr);
    manufacturer
        .into_iter()
        .map(|(vendor_id, payload)| RawAdvertisement {
            address,
            vendor_id,
            payload: payload.to_vec(),
            service_uuids: service_uuids.clone(),
            rssi,
        })
        .collect()
}

/// Radio backed by raw HCI sockets on one controller.
pub struct HciRadio {
    dev_id: u16,
    cmd_fd: OwnedFd,
    reader: Option<JoinHandle<()>>,
}

impl HciRadio {
    /// Open the command socket for `hciN` and program passive scan parameters.
    pub fn open(dev_id: u16) -> Result<Self, ScanError> {
        let cmd_fd = open_hci_socket(dev_id)?;
        let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, &scan_parameters());
        send_hci_command(&cmd_fd, &packet)?;
        info!("HCI controller hci{dev_id} ready");
        Ok(Self {
            dev_id,
            cmd_fd,
            reader: None,
        })
    }

    fn abort_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Radio for HciRadio {
    fn start(&mut self) -> BoxFuture<'_, Result<mpsc::Receiver<RawAdvertisement>, ScanError>> {
        Box::pin(async move {
            self.abort_reader();

            let fd = open_hci_socket(self.dev_id)?;
            set_hci_filter(&fd)?;
            let async_fd = AsyncFd::new(fd)
                .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {e}")))?;

            send_hci_command(&self.cmd_fd, &scan_enable_packet(true))?;

            let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);
            self.reader = Some(tokio::spawn(read_events(async_fd, tx)));
            Ok(rx)
        })
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), ScanError>> {
        Box::pin(async move {
            // The reader owns the event socket; aborting it closes the socket.
            self.abort_reader();
            send_hci_command(&self.cmd_fd, &scan_enable_packet(false))
        })
    }
}

impl Drop for HciRadio {
    fn drop(&mut self) {
        self.abort_reader();
        let _ = send_hci_command(&self.cmd_fd, &scan_enable_packet(false));
    }
}

/// Read HCI events until the receiver goes away or the socket fails.
async fn read_events(async_fd: AsyncFd<OwnedFd>, tx: mpsc::Sender<RawAdvertisement>) {
    let mut buf = [0u8; 258]; // Max HCI event size

    loop {
        let mut guard = match async_fd.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                debug!(error = %e, "HCI socket not readable");
                return;
            }
        };

        // Drain all available packets before waiting again
        loop {
            let n = match guard.try_io(|inner| {
                let ret = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut c_void,
                        buf.len(),
                    )
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            }) {
                Ok(Ok(n)) if n > 0 => n,
                Ok(Ok(_)) => return, // EOF
                Ok(Err(e)) => {
                    debug!(error = %e, "HCI read failed");
                    return;
                }
                Err(_would_block) => break,
            };

            for advertisement in parse_advertising_report(&buf[..n]) {
                if tx.send(advertisement).await.is_err() {
                    return;
                }
            }
        }
    }
}
