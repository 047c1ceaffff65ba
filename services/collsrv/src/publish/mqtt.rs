//! MQTT message bus sink

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BusStatus, MessageBus};
use crate::config::MqttConfig;
use crate::error::{CollectorError, Result};

/// Outgoing request queue of the client
const REQUEST_CAPACITY: usize = 256;
const RECONNECT_PAUSE: Duration = Duration::from_secs(5);

pub struct MqttBus {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    host: String,
    port: u16,
}

impl MqttBus {
    /// Create the client and spawn its event loop; connection happens in the background
    pub fn start(config: &MqttConfig, cancel: CancellationToken) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&connected);
        let broker = format!("{}:{}", config.host, config.port);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            flag.store(true, Ordering::Relaxed);
                            info!("MQTT connected: {}", broker);
                        },
                        Ok(event) => debug!("MQTT event: {:?}", event),
                        Err(e) => {
                            if flag.swap(false, Ordering::Relaxed) {
                                warn!("MQTT connection lost ({}): {}", broker, e);
                            } else {
                                debug!("MQTT connect to {} failed: {}", broker, e);
                            }
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(RECONNECT_PAUSE) => {},
                            }
                        },
                    },
                }
            }
            flag.store(false, Ordering::Relaxed);
            debug!("MQTT event loop stopped");
        });

        Self {
            client,
            connected,
            host: config.host.clone(),
            port: config.port,
        }
    }
}

impl MessageBus for MqttBus {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, retain, payload)
            .map_err(|e| CollectorError::bus(format!("{}: {}", topic, e)))
    }

    fn status(&self) -> BusStatus {
        BusStatus {
            kind: "mqtt".to_string(),
            connected: self.connected.load(Ordering::Relaxed),
            host: Some(self.host.clone()),
            port: Some(self.port),
        }
    }
}
