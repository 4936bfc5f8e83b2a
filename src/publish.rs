//! Delivery of readings to the message bus.

use crate::bus::{BusClient, BusError, PublishOptions};
use crate::measurement::Reading;
use crate::message::{OutboundMessage, topic};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Bounded retry with a fixed pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. Zero is treated as one.
    pub attempts: u32,
    /// Pause between two attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Errors returned by [`PublishCycle::publish`].
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to serialize reading: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to format timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
    #[error("gave up publishing to {topic} after {attempts} attempts: {last}")]
    RetriesExhausted {
        topic: String,
        attempts: u32,
        #[source]
        last: BusError,
    },
}

/// Serializes readings and hands them to the bus.
pub struct PublishCycle {
    bus: Arc<dyn BusClient>,
    topic_prefix: String,
    options: PublishOptions,
    retry: RetryPolicy,
}

impl PublishCycle {
    pub fn new(
        bus: Arc<dyn BusClient>,
        topic_prefix: impl Into<String>,
        options: PublishOptions,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            bus,
            topic_prefix: topic_prefix.into(),
            options,
            retry,
        }
    }

    /// Publish one reading, stamped with the current time.
    ///
    /// Delivery is at most once: when every attempt fails the reading is lost.
    pub async fn publish(&self, reading: &Reading) -> Result<(), PublishError> {
        let message = OutboundMessage::new(reading, OffsetDateTime::now_utc())?;
        let payload = message.to_json()?;
        let topic = topic(&self.topic_prefix, &reading.record.color);
        let attempts = self.retry.attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.bus.publish(&topic, payload.clone(), self.options).await {
                Ok(()) => {
                    info!(
                        %topic,
                        gravity = message.specific_gravity_uncalibrated,
                        temperature = message.temperature_celsius_uncalibrated,
                        "published reading"
                    );
                    return Ok(());
                }
                Err(last) if attempt >= attempts => {
                    return Err(PublishError::RetriesExhausted {
                        topic,
                        attempts,
                        last,
                    });
                }
                Err(e) => {
                    debug!(%topic, attempt, error = %e, "publish attempt failed, retrying");
                    sleep(self.retry.backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Close the bus connection.
    pub async fn shutdown(&self) {
        if let Err(e) = self.bus.disconnect().await {
            warn!(error = %e, "error disconnecting from message bus");
        }
    }
}
