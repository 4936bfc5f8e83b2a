//! One bounded discovery window.
//!
//! A [`ScanCycle`] starts the radio, reads advertisements until the first one
//! that decodes, the window elapses, or shutdown is requested, and then stops
//! the radio again. Rejected and undecodable frames are logged and skipped.

use crate::advertisement::RawAdvertisement;
use crate::decoder::PayloadDecoder;
use crate::filter::{self, Announcement};
use crate::measurement::Reading;
use crate::scanner::{Radio, ScanError};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Progress of a single window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
    Found,
    TimedOut,
    /// Terminal. The radio has been told to stop.
    Stopped,
}

/// Result of a window that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// First valid reading of the window
    Found(Reading),
    /// No valid reading arrived in time
    TimedOut,
    /// Shutdown was requested while scanning
    Cancelled,
}

pub struct ScanCycle {
    decoder: PayloadDecoder,
    window: Duration,
    state: ScanState,
    announcements: Vec<Announcement>,
}

impl ScanCycle {
    pub fn new(decoder: PayloadDecoder, window: Duration) -> Self {
        Self {
            decoder,
            window,
            state: ScanState::Idle,
            announcements: Vec::new(),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Distinct announcements heard during the last window, in arrival order.
    pub fn announcements(&self) -> &[Announcement] {
        &self.announcements
    }

    fn transition(&mut self, next: ScanState) {
        trace!(from = ?self.state, to = ?next, "scan state");
        self.state = next;
    }

    /// Run one window against `radio`.
    ///
    /// The radio is stopped on every exit path, including a failed start.
    /// Errors are returned only when the radio itself fails; an empty window
    /// is [`ScanOutcome::TimedOut`].
    pub async fn run(
        &mut self,
        radio: &mut dyn Radio,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome, ScanError> {
        self.transition(ScanState::Scanning);
        debug!(window = ?self.window, "starting scan window");

        let mut advertisements = match radio.start().await {
            Ok(advertisements) => advertisements,
            Err(e) => {
                stop_radio(radio).await;
                self.transition(ScanState::Stopped);
                return Err(e);
            }
        };

        let window = self.window;
        let decoder = &self.decoder;
        let announcements = &mut self.announcements;
        announcements.clear();

        let collect = async {
            while let Some(advertisement) = advertisements.recv().await {
                if let Some(announcement) = filter::announcement(&advertisement) {
                    if !announcements.contains(&announcement) {
                        log_announcement(&advertisement, &announcement);
                        announcements.push(announcement);
                    }
                    continue;
                }
                if !filter::accepts(&advertisement) {
                    debug!(
                        address = %advertisement.address,
                        vendor_id = format_args!("0x{:04X}", advertisement.vendor_id),
                        payload = %advertisement.payload_hex(),
                        "ignoring advertisement"
                    );
                    continue;
                }
                match decoder.decode(&advertisement) {
                    Ok(record) => {
                        return Ok(Reading {
                            record,
                            address: advertisement.address,
                            rssi: advertisement.rssi,
                        });
                    }
                    Err(e) => warn!(
                        address = %advertisement.address,
                        payload = %advertisement.payload_hex(),
                        error = %e,
                        "dropping undecodable advertisement"
                    ),
                }
            }
            Err(ScanError::StreamClosed)
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(ScanOutcome::Cancelled),
            collected = timeout(window, collect) => match collected {
                Ok(Ok(reading)) => Ok(ScanOutcome::Found(reading)),
                Ok(Err(e)) => Err(e),
                Err(_elapsed) => Ok(ScanOutcome::TimedOut),
            },
        };

        match &outcome {
            Ok(ScanOutcome::Found(reading)) => {
                debug!(address = %reading.address, color = %reading.record.color, "beacon found");
                self.transition(ScanState::Found);
            }
            Ok(ScanOutcome::TimedOut) => {
                debug!("no beacon in scan window");
                self.transition(ScanState::TimedOut);
            }
            Ok(ScanOutcome::Cancelled) | Err(_) => {}
        }

        stop_radio(radio).await;
        self.transition(ScanState::Stopped);
        outcome
    }
}

fn log_announcement(advertisement: &RawAdvertisement, announcement: &Announcement) {
    match announcement {
        Announcement::Firmware(version) => {
            info!(address = %advertisement.address, %version, "RAPT Pill firmware");
        }
        Announcement::DeviceType(device_type) => {
            info!(address = %advertisement.address, %device_type, "RAPT Pill device type");
        }
    }
}

async fn stop_radio(radio: &mut dyn Radio) {
    if let Err(e) = radio.stop().await {
        warn!(error = %e, "failed to stop discovery");
    }
}
