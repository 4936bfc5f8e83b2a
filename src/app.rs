//! Core application runner for `rapt-pill-mqtt`.
//!
//! This module is decoupled from logging setup, signal handling and process
//! exit codes so the scheduling loop can be tested deterministically with an
//! injected radio and bus.

use crate::bus::{BusClient, MqttBus, MqttConfig, PublishOptions, qos_from_level};
use crate::color::{ColorEntry, ColorTable, parse_color_entry};
use crate::decoder::PayloadDecoder;
use crate::duration::parse_duration;
use crate::message::DEFAULT_TOPIC_PREFIX;
use crate::publish::{PublishCycle, RetryPolicy};
use crate::scan_cycle::{ScanCycle, ScanOutcome};
use crate::scanner::{self, Backend, Radio, ScanError};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the daemon. Every flag can also be set from the environment.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// MQTT broker host
    #[arg(long, env = "MQTT_IP", default_value = "127.0.0.1")]
    pub mqtt_host: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    /// MQTT username, used only together with a password
    #[arg(long, env = "MQTT_USERNAME")]
    pub mqtt_username: Option<String>,

    /// MQTT password
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: Option<String>,

    /// MQTT client identifier
    #[arg(long, env = "MQTT_CLIENT_ID", default_value = "rapt-pill-mqtt")]
    pub mqtt_client_id: String,

    /// QoS level for published readings (0, 1 or 2)
    #[arg(long, env = "MQTT_QOS", default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub mqtt_qos: u8,

    /// Publish readings as retained messages
    #[arg(long, env = "MQTT_RETAIN", default_value_t = true, action = clap::ArgAction::Set)]
    pub mqtt_retain: bool,

    /// Topic prefix; readings go to <prefix>/<color>
    #[arg(long, env = "RAPT_TOPIC_PREFIX", default_value = DEFAULT_TOPIC_PREFIX)]
    pub topic_prefix: String,

    /// How long one scan window listens for a beacon.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, env = "RAPT_SCAN_WINDOW", default_value = "75s", value_parser = parse_duration)]
    pub scan_window: Duration,

    /// Pause between the end of one cycle and the next scan window
    #[arg(long, env = "RAPT_INTERVAL", default_value = "5m", value_parser = parse_duration)]
    pub interval: Duration,

    /// Total publish attempts per reading
    #[arg(long, env = "RAPT_PUBLISH_ATTEMPTS", default_value_t = 3)]
    pub publish_attempts: u32,

    /// Pause between publish attempts
    #[arg(long, env = "RAPT_PUBLISH_BACKOFF", default_value = "500ms", value_parser = parse_duration)]
    pub publish_backoff: Duration,

    /// Add or override a beacon color.
    /// Format: --color a495bb50-c5b1-4b44-b512-1370f02d74de=Orange
    #[arg(
        long = "color",
        env = "RAPT_COLORS",
        value_delimiter = ',',
        value_parser = parse_color_entry,
        value_name = "UUID=NAME"
    )]
    pub colors: Vec<ColorEntry>,

    /// Bluetooth scanner backend to use
    #[arg(long, env = "RAPT_BACKEND", default_value_t, value_enum)]
    pub backend: Backend,

    /// Verbose output, log rejected and undecodable advertisements
    #[arg(short = 'v', long = "verbose", env = "RAPT_VERBOSE")]
    pub verbose: bool,
}

impl Options {
    pub fn mqtt_config(&self) -> MqttConfig {
        MqttConfig {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            client_id: self.mqtt_client_id.clone(),
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            ..MqttConfig::default()
        }
    }

    pub fn publish_options(&self) -> PublishOptions {
        PublishOptions {
            qos: qos_from_level(self.mqtt_qos),
            retain: self.mqtt_retain,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.publish_attempts,
            backoff: self.publish_backoff,
        }
    }
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
}

/// How one scan/publish cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Published,
    PublishFailed,
    NoReading,
    ScanFailed,
    Cancelled,
}

/// The top-level loop: scan, publish what was found, sleep, repeat.
pub struct Scheduler {
    radio: Box<dyn Radio>,
    scan: ScanCycle,
    publisher: PublishCycle,
    interval: Duration,
}

impl Scheduler {
    pub fn new(
        radio: Box<dyn Radio>,
        scan: ScanCycle,
        publisher: PublishCycle,
        interval: Duration,
    ) -> Self {
        Self {
            radio,
            scan,
            publisher,
            interval,
        }
    }

    /// Run a single cycle. Failures are logged and reported, never propagated.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleOutcome {
        match self.scan.run(self.radio.as_mut(), cancel).await {
            Ok(ScanOutcome::Found(reading)) => match self.publisher.publish(&reading).await {
                Ok(()) => CycleOutcome::Published,
                Err(e) => {
                    warn!(error = %e, "reading lost");
                    CycleOutcome::PublishFailed
                }
            },
            Ok(ScanOutcome::TimedOut) => CycleOutcome::NoReading,
            Ok(ScanOutcome::Cancelled) => CycleOutcome::Cancelled,
            Err(e) => {
                warn!(error = %e, "scan window failed");
                CycleOutcome::ScanFailed
            }
        }
    }

    /// Loop until `cancel` fires.
    pub async fn run(&mut self, cancel: &CancellationToken) {
        while !cancel.is_cancelled() {
            let outcome = self.run_cycle(cancel).await;
            debug!(?outcome, next_in = ?self.interval, "cycle finished");
            if outcome == CycleOutcome::Cancelled {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(self.interval) => {}
            }
        }
        info!("shutting down");
    }

    /// Release the bus connection.
    pub async fn shutdown(&self) {
        self.publisher.shutdown().await;
    }
}

/// Open the radio and the bus, then run the scheduler until `cancel` fires.
///
/// # Errors
/// Returns `RunError::Scan` if the radio backend cannot be opened
pub async fn run(options: Options, cancel: CancellationToken) -> Result<(), RunError> {
    let colors = Arc::new(ColorTable::with_entries(&options.colors));
    let radio = scanner::open(options.backend).await?;
    info!(backend = %options.backend, colors = colors.len(), "radio ready");

    let bus: Arc<dyn BusClient> = Arc::new(MqttBus::connect(&options.mqtt_config()));
    let publisher = PublishCycle::new(
        bus,
        options.topic_prefix.clone(),
        options.publish_options(),
        options.retry_policy(),
    );
    let scan = ScanCycle::new(PayloadDecoder::new(colors), options.scan_window);

    let mut scheduler = Scheduler::new(radio, scan, publisher, options.interval);
    scheduler.run(&cancel).await;
    scheduler.shutdown().await;
    Ok(())
}
