//! Message bus client.
//!
//! [`BusClient`] is the seam between the publish cycle and the broker. The
//! production implementation, [`MqttBus`], keeps one `rumqttc` connection for
//! the lifetime of the process and reconnects in the background when the
//! broker goes away.

use futures::future::BoxFuture;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Delivery options for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            qos: QoS::ExactlyOnce,
            retain: true,
        }
    }
}

/// Map a numeric MQTT QoS level to [`QoS`]. Levels above 2 clamp to 2.
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Errors reported by a bus client for a single publish.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    #[error("not connected to broker")]
    NotConnected,
    #[error("MQTT client error: {0}")]
    Client(String),
    #[error("MQTT connection task has stopped")]
    Closed,
}

impl From<rumqttc::ClientError> for BusError {
    fn from(err: rumqttc::ClientError) -> Self {
        BusError::Client(err.to_string())
    }
}

/// A message bus accepting opaque payloads on hierarchical topics.
pub trait BusClient: Send + Sync {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> BoxFuture<'a, Result<(), BusError>>;

    /// Close the connection. Further publishes fail.
    fn disconnect(&self) -> BoxFuture<'_, Result<(), BusError>>;
}

/// Broker connection parameters.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// How long a publish waits for a missing connection
    pub connect_timeout: Duration,
    /// Pause after a connection error before the next attempt
    pub reconnect_delay: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "rapt-pill-mqtt".to_string(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl MqttConfig {
    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        // Credentials only apply as a pair
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }
        options
    }
}

/// MQTT bus client on top of `rumqttc`.
///
/// A background task drives the event loop and publishes the connection state
/// on a watch channel. `rumqttc` reconnects on the next poll after an error,
/// so a broker outage never needs a process restart.
pub struct MqttBus {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    connect_timeout: Duration,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Create the client and start connecting in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(config: &MqttConfig) -> Self {
        let (client, mut eventloop) = AsyncClient::new(config.mqtt_options(), 10);
        let (state_tx, state_rx) = watch::channel(false);
        let reconnect_delay = config.reconnect_delay;
        let broker = format!("{}:{}", config.host, config.port);

        info!(%broker, client_id = %config.client_id, "connecting to MQTT broker");

        let event_loop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            info!(%broker, "MQTT connected");
                            state_tx.send_replace(true);
                        } else {
                            warn!(%broker, code = ?ack.code, "MQTT broker refused connection");
                        }
                    }
                    Ok(Event::Incoming(Packet::PingResp)) => {
                        debug!("MQTT ping response received");
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        state_tx.send_replace(false);
                        debug!("MQTT disconnect sent");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if state_tx.send_replace(false) {
                            warn!(%broker, error = %e, "MQTT connection lost, reconnecting");
                        } else {
                            debug!(%broker, error = %e, "MQTT connection attempt failed");
                        }
                        sleep(reconnect_delay).await;
                    }
                }
            }
        });

        Self {
            client,
            connected: state_rx,
            connect_timeout: config.connect_timeout,
            event_loop: Mutex::new(Some(event_loop)),
        }
    }

    async fn wait_connected(&self) -> Result<(), BusError> {
        let mut connected = self.connected.clone();
        let waited = timeout(self.connect_timeout, connected.wait_for(|up| *up))
            .await
            .map(|changed| changed.is_ok());
        match waited {
            Ok(true) => Ok(()),
            Ok(false) => Err(BusError::Closed),
            Err(_elapsed) => Err(BusError::NotConnected),
        }
    }

    fn take_event_loop(&self) -> Option<JoinHandle<()>> {
        match self.event_loop.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl BusClient for MqttBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        Box::pin(async move {
            self.wait_connected().await?;
            self.client
                .publish(topic, options.qos, options.retain, payload)
                .await?;
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), BusError>> {
        Box::pin(async move {
            let Some(mut event_loop) = self.take_event_loop() else {
                return Ok(());
            };
            let result = self.client.disconnect().await.map_err(BusError::from);
            // Give the event loop a moment to flush the DISCONNECT packet.
            if timeout(Duration::from_secs(2), &mut event_loop).await.is_err() {
                debug!("MQTT event loop did not stop in time");
                event_loop.abort();
            }
            result
        })
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        if let Some(event_loop) = self.take_event_loop() {
            event_loop.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_from_level() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_level(9), QoS::ExactlyOnce);
    }

    #[test]
    fn test_default_publish_options() {
        let options = PublishOptions::default();
        assert_eq!(options.qos, QoS::ExactlyOnce);
        assert!(options.retain);
    }

    #[tokio::test]
    async fn test_publish_without_broker_times_out() {
        let config = MqttConfig {
            // Nothing listens on port 9 on loopback in the test environment
            port: 9,
            connect_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let bus = MqttBus::connect(&config);
        let result = bus
            .publish("rapt/pill/Orange", b"{}".to_vec(), PublishOptions::default())
            .await;
        assert_eq!(result, Err(BusError::NotConnected));
    }

    /// CONNACK, session not present, connection accepted
    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    #[tokio::test]
    async fn test_publish_after_broker_drops_connection() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;
        use tokio::sync::oneshot;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (reconnected_tx, reconnected_rx) = oneshot::channel();

        let broker = tokio::spawn(async move {
            let mut buf = [0u8; 512];

            // First session: accept the client, then hang up on it
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.read(&mut buf).await.unwrap();
            socket.write_all(&CONNACK).await.unwrap();
            drop(socket);

            let (mut socket, _) = listener.accept().await.unwrap();
            socket.read(&mut buf).await.unwrap();
            socket.write_all(&CONNACK).await.unwrap();
            let _ = reconnected_tx.send(());

            let n = socket.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        let config = MqttConfig {
            port,
            reconnect_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let bus = MqttBus::connect(&config);

        timeout(Duration::from_secs(5), reconnected_rx)
            .await
            .unwrap()
            .unwrap();

        let options = PublishOptions {
            qos: QoS::AtMostOnce,
            retain: false,
        };
        let result = bus
            .publish("rapt/pill/Orange", b"{}".to_vec(), options)
            .await;
        assert_eq!(result, Ok(()));

        let packet = timeout(Duration::from_secs(5), broker)
            .await
            .unwrap()
            .unwrap();
        // PUBLISH, QoS 0, no retain
        assert_eq!(packet[0], 0x30);
        assert!(packet.windows(16).any(|w| w == b"rapt/pill/Orange"));
    }
}
