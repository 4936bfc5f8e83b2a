//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, Radio, ScanError};
use crate::advertisement::RawAdvertisement;
use crate::decoder::RAPT_VENDOR_ID;
use crate::filter::FIRMWARE_VENDOR_ID;
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{Adapter, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::StreamExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace};

/// AD type of manufacturer-specific data.
const MANUFACTURER_DATA_TYPE: u8 = 0xFF;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Monitor patterns matching the leading company identifier of RAPT readings
/// and of firmware announcements.
fn monitor_patterns() -> Vec<Pattern> {
    [RAPT_VENDOR_ID, FIRMWARE_VENDOR_ID]
        .into_iter()
        .map(|vendor_id| Pattern {
            data_type: MANUFACTURER_DATA_TYPE,
            start_position: 0,
            content: vendor_id.to_le_bytes().to_vec(),
        })
        .collect()
}

/// Manufacturer data as BlueZ reports it, keyed by company identifier.
type ManufacturerData = HashMap<u16, Vec<u8>>;

/// Radio backed by the default BlueZ adapter.
///
/// Each window registers an advertisement monitor and follows property
/// changes of every device it reports. BlueZ keeps the last manufacturer data
/// of a device after it goes out of range, so only entries that changed since
/// the window started are forwarded.
pub struct BluerRadio {
    // Keeps the D-Bus connection alive for the adapter handle.
    _session: Session,
    adapter: Adapter,
    monitor: Option<JoinHandle<()>>,
}

impl BluerRadio {
    /// Connect to BlueZ and power the default adapter.
    pub async fn open() -> Result<Self, ScanError> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;

        info!(adapter = adapter.name(), "BlueZ adapter ready");

        Ok(Self {
            _session: session,
            adapter,
            monitor: None,
        })
    }

    fn abort_monitor(&mut self) {
        if let Some(task) = self.monitor.take() {
            // Dropping the monitor handle and the device tasks inside the
            // task unregisters the monitor.
            task.abort();
        }
    }

    /// Manufacturer data BlueZ already holds for known devices.
    async fn cached_data(&self) -> Result<HashMap<Address, ManufacturerData>, ScanError> {
        let mut cached = HashMap::new();
        for address in self.adapter.device_addresses().await? {
            let Ok(device) = self.adapter.device(address) else {
                continue;
            };
            if let Ok(Some(data)) = device.manufacturer_data().await {
                cached.insert(address, data);
            }
        }
        Ok(cached)
    }
}

impl Radio for BluerRadio {
    fn start(&mut self) -> BoxFuture<'_, Result<mpsc::Receiver<RawAdvertisement>, ScanError>> {
        Box::pin(async move {
            self.abort_monitor();

            let mut cached = self.cached_data().await?;
            trace!(devices = cached.len(), "cached device data");

            let monitor_manager = self.adapter.monitor().await?;
            let mut monitor_handle = monitor_manager
                .register(Monitor {
                    patterns: Some(monitor_patterns()),
                    ..Default::default()
                })
                .await?;
            let adapter = self.adapter.clone();
            let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

            self.monitor = Some(tokio::spawn(async move {
                let _monitor_manager = monitor_manager;
                let mut devices = JoinSet::new();

                while let Some(event) = monitor_handle.next().await {
                    let MonitorEvent::DeviceFound(device_id) = event else {
                        continue;
                    };
                    let address = device_id.device;
                    let seen = cached.remove(&address).unwrap_or_default();
                    devices.spawn(follow_device(adapter.clone(), address, seen, tx.clone()));
                }
            }));

            Ok(rx)
        })
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), ScanError>> {
        Box::pin(async move {
            self.abort_monitor();
            Ok(())
        })
    }
}

impl Drop for BluerRadio {
    fn drop(&mut self) {
        self.abort_monitor();
    }
}

/// Forward fresh manufacturer data of one device until the window ends.
async fn follow_device(
    adapter: Adapter,
    address: Address,
    mut seen: ManufacturerData,
    tx: mpsc::Sender<RawAdvertisement>,
) {
    if let Err(e) = forward_updates(&adapter, address, &mut seen, &tx).await {
        debug!(%address, error = %e, "failed to read device properties");
    }
}

async fn forward_updates(
    adapter: &Adapter,
    address: Address,
    seen: &mut ManufacturerData,
    tx: &mpsc::Sender<RawAdvertisement>,
) -> Result<(), bluer::Error> {
    let device = adapter.device(address)?;
    // Subscribe before the first read so no update falls in between.
    let events = device.events().await?;

    if let Some(data) = device.manufacturer_data().await?
        && !send_fresh(&device, &data, seen, tx).await?
    {
        return Ok(());
    }

    let mut events = std::pin::pin!(events);
    while let Some(event) = events.next().await {
        let DeviceEvent::PropertyChanged(DeviceProperty::ManufacturerData(data)) = event else {
            continue;
        };
        if !send_fresh(&device, &data, seen, tx).await? {
            return Ok(());
        }
    }
    Ok(())
}

/// Send every entry that changed since last seen. Returns `false` once the
/// receiver is gone.
async fn send_fresh(
    device: &Device,
    data: &ManufacturerData,
    seen: &mut ManufacturerData,
    tx: &mpsc::Sender<RawAdvertisement>,
) -> Result<bool, bluer::Error> {
    let fresh = fresh_entries(data, seen);
    if fresh.is_empty() {
        return Ok(true);
    }

    let address = device.address();
    let rssi = device.rssi().await?;
    let mut service_uuids: Vec<_> = device
        .uuids()
        .await?
        .unwrap_or_default()
        .into_iter()
        .collect();
    service_uuids.sort();

    trace!(%address, entries = fresh.len(), "fresh manufacturer data");

    for (vendor_id, payload) in fresh {
        let advertisement = RawAdvertisement {
            address: address.into(),
            vendor_id,
            payload,
            service_uuids: service_uuids.clone(),
            rssi,
        };
        if tx.send(advertisement).await.is_err() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Entries of `current` whose bytes differ from `seen`, which is updated.
fn fresh_entries(current: &ManufacturerData, seen: &mut ManufacturerData) -> Vec<(u16, Vec<u8>)> {
    let mut fresh: Vec<(u16, Vec<u8>)> = current
        .iter()
        .filter(|(vendor_id, payload)| seen.get(*vendor_id) != Some(*payload))
        .map(|(vendor_id, payload)| (*vendor_id, payload.clone()))
        .collect();
    fresh.sort_unstable_by_key(|(vendor_id, _)| *vendor_id);
    for (vendor_id, payload) in &fresh {
        seen.insert(*vendor_id, payload.clone());
    }
    fresh
}
