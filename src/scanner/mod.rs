//! BLE radio abstraction.
//!
//! A [`Radio`] is opened once at startup and then started and stopped around
//! every scan window. While started it yields every manufacturer-data frame
//! it hears as a [`RawAdvertisement`]; deciding which frames matter, and when
//! to stop, is left to the scan cycle.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::advertisement::RawAdvertisement;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for radio operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// The backend stopped delivering advertisements in the middle of a window
    #[error("advertisement stream closed unexpectedly")]
    StreamClosed,
}

/// Channel buffer size for advertisements of one scan window.
pub const ADVERTISEMENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Discovery control over a local radio adapter.
pub trait Radio: Send {
    /// Start discovery. Advertisements arrive on the returned receiver until
    /// [`Radio::stop`] is called.
    fn start(&mut self) -> BoxFuture<'_, Result<mpsc::Receiver<RawAdvertisement>, ScanError>>;

    /// Stop discovery and release the per-window scan resources.
    ///
    /// Must be safe to call when discovery is not running.
    fn stop(&mut self) -> BoxFuture<'_, Result<(), ScanError>>;
}

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            #[cfg(feature = "hci")]
            "hci" | "raw" => Ok(Backend::Hci),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Open the radio for the selected backend.
///
/// This is the only radio step whose failure is fatal: an adapter that is
/// missing or not permitted at startup cannot recover by retrying cycles.
pub async fn open(backend: Backend) -> Result<Box<dyn Radio>, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => Ok(Box::new(bluer::BluerRadio::open().await?)),
        #[cfg(feature = "hci")]
        Backend::Hci => Ok(Box::new(hci::HciRadio::open(0)?)),
    }
}
