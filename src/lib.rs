//! `rapt-pill-mqtt` library.
//!
//! The binary (`src/main.rs`) is responsible for logging setup, signal handling
//! and process exit codes. The scan/publish loop lives in [`crate::app`] where
//! it can be tested deterministically with an injected radio and bus.

pub mod advertisement;
pub mod app;
pub mod bus;
pub mod color;
pub mod decoder;
pub mod duration;
pub mod filter;
pub mod measurement;
pub mod message;
pub mod publish;
pub mod scan_cycle;
pub mod scanner;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use advertisement::{MacAddress, RawAdvertisement};
pub use bus::{BusClient, BusError, MqttBus, MqttConfig, PublishOptions};
pub use color::{ColorEntry, ColorTable};
pub use decoder::{DecodeError, PayloadDecoder, decode};
pub use measurement::{Accelerometer, MeasurementRecord, Reading};
pub use message::OutboundMessage;
pub use publish::{PublishCycle, PublishError, RetryPolicy};
pub use scan_cycle::{ScanCycle, ScanOutcome, ScanState};
pub use scanner::{Backend, Radio, ScanError};
