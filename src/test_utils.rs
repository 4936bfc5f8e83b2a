use crate::advertisement::{MacAddress, RawAdvertisement};
use crate::bus::{BusClient, BusError, PublishOptions};
use crate::decoder::RAPT_VENDOR_ID;
use crate::scanner::{Radio, ScanError};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::{Uuid, uuid};

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Service UUID of the built-in "Orange" entry.
pub const ORANGE_UUID: Uuid = uuid!("a495bb50-c5b1-4b44-b512-1370f02d74de");

/// Build the required part of a RAPT payload.
pub fn payload(format_version: u8, temperature_tenths: i16, gravity_milli: u16) -> Vec<u8> {
    let mut bytes = vec![format_version];
    bytes.extend_from_slice(&temperature_tenths.to_be_bytes());
    bytes.extend_from_slice(&gravity_milli.to_be_bytes());
    bytes
}

/// Wrap a payload in an Orange RAPT advertisement.
pub fn advertisement(payload: Vec<u8>) -> RawAdvertisement {
    RawAdvertisement {
        address: TEST_MAC,
        vendor_id: RAPT_VENDOR_ID,
        payload,
        service_uuids: vec![ORANGE_UUID],
        rssi: Some(-60),
    }
}

/// Counters shared between a [`FakeRadio`] and the test observing it.
#[derive(Debug, Default)]
pub struct RadioStats {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl RadioStats {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

/// What a [`FakeRadio`] does on one `start()`.
#[derive(Debug, Clone)]
pub enum Window {
    /// Deliver these advertisements, then stay quiet until stopped
    Deliver(Vec<RawAdvertisement>),
    /// Deliver these advertisements, then close the stream
    DeliverThenClose(Vec<RawAdvertisement>),
    /// Fail to start
    FailStart,
}

/// Scripted radio, one [`Window`] per scan cycle.
///
/// After the script runs out every window is quiet. If `cancel_when_done` is
/// set, the token is cancelled on the first start past the end of the script.
pub struct FakeRadio {
    windows: VecDeque<Window>,
    sender: Option<mpsc::Sender<RawAdvertisement>>,
    cancel_when_done: Option<CancellationToken>,
    pub stats: Arc<RadioStats>,
}

impl FakeRadio {
    pub fn new(windows: Vec<Window>) -> Self {
        Self {
            windows: windows.into(),
            sender: None,
            cancel_when_done: None,
            stats: Arc::default(),
        }
    }

    pub fn cancel_when_done(mut self, token: CancellationToken) -> Self {
        self.cancel_when_done = Some(token);
        self
    }
}

impl Radio for FakeRadio {
    fn start(&mut self) -> BoxFuture<'_, Result<mpsc::Receiver<RawAdvertisement>, ScanError>> {
        Box::pin(async move {
            self.stats.starts.fetch_add(1, Ordering::SeqCst);

            let window = match self.windows.pop_front() {
                Some(window) => window,
                None => {
                    if let Some(token) = &self.cancel_when_done {
                        token.cancel();
                    }
                    Window::Deliver(Vec::new())
                }
            };

            let (advertisements, close) = match window {
                Window::Deliver(advertisements) => (advertisements, false),
                Window::DeliverThenClose(advertisements) => (advertisements, true),
                Window::FailStart => {
                    return Err(ScanError::Bluetooth("adapter went away".to_string()));
                }
            };

            let (tx, rx) = mpsc::channel(advertisements.len().max(1));
            for advertisement in advertisements {
                let _ = tx.try_send(advertisement);
            }
            if !close {
                self.sender = Some(tx);
            }
            Ok(rx)
        })
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), ScanError>> {
        Box::pin(async move {
            self.stats.stops.fetch_add(1, Ordering::SeqCst);
            self.sender = None;
            Ok(())
        })
    }
}

/// A message accepted by [`FakeBus`].
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub options: PublishOptions,
}

/// Bus that fails a set number of publishes before accepting them.
#[derive(Debug, Default)]
pub struct FakeBus {
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
    disconnects: AtomicUsize,
    published: Mutex<Vec<Published>>,
}

impl FakeBus {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }
}

impl BusClient for FakeBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(BusError::NotConnected);
            }
            self.published.lock().unwrap().push(Published {
                topic: topic.to_string(),
                payload,
                options,
            });
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), BusError>> {
        Box::pin(async move {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}
