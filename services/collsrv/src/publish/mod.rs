//! Fan-out publisher: message bus sink plus realtime subscribers
//!
//! Both sinks are best-effort. Failures are logged and never reach the caller.

pub mod mqtt;
pub mod realtime;

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::model::{Reading, Sensor};

pub use mqtt::MqttBus;
pub use realtime::{topic_matches, RealtimeHub};

pub const TOPIC_STATUS: &str = "system/status";
pub const TOPIC_DATABASE: &str = "system/database";
pub const TOPIC_COLLECTOR: &str = "system/collector";
pub const TOPIC_RESOURCES: &str = "system/resources";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusStatus {
    pub kind: String,
    pub connected: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl BusStatus {
    pub fn disabled() -> Self {
        Self {
            kind: "none".to_string(),
            connected: false,
            host: None,
            port: None,
        }
    }
}

/// Publish side of a pub/sub broker; must not block the caller
pub trait MessageBus: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()>;
    fn status(&self) -> BusStatus;
}

pub fn reading_topic(machine: &str, device: &str, sensor: &str) -> String {
    format!("machines/{}/{}/{}", machine, device, sensor)
}

/// Bus message of one successful reading
#[derive(Debug, Clone, Serialize)]
pub struct ReadingPayload<'a> {
    pub sensor_code: &'a str,
    pub timestamp: String,
    pub value: f64,
    pub display_value: String,
    pub raw_value: Option<f64>,
    pub quality: i64,
    pub unit: &'a str,
    pub machine: &'a str,
    pub device: &'a str,
}

pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Clone)]
pub struct Publisher {
    bus: Option<Arc<dyn MessageBus>>,
    hub: Arc<RealtimeHub>,
}

impl Publisher {
    pub fn new(bus: Option<Arc<dyn MessageBus>>, hub: Arc<RealtimeHub>) -> Self {
        Self { bus, hub }
    }

    pub fn hub(&self) -> &Arc<RealtimeHub> {
        &self.hub
    }

    pub fn bus_status(&self) -> BusStatus {
        self.bus
            .as_ref()
            .map_or_else(BusStatus::disabled, |bus| bus.status())
    }

    /// Publish a reading under `machines/{machine}/{device}/{sensor}`; failed readings are skipped
    pub fn reading(&self, machine: &str, device: &str, sensor: &Sensor, reading: &Reading) {
        let Some(value) = reading.value.filter(|_| reading.is_good()) else {
            return;
        };
        let payload = ReadingPayload {
            sensor_code: &sensor.spec.code,
            timestamp: iso_timestamp(reading.timestamp),
            value,
            display_value: sensor.spec.display(value),
            raw_value: reading.raw_value,
            quality: reading.quality.code(),
            unit: &sensor.spec.unit,
            machine,
            device,
        };
        match serde_json::to_value(&payload) {
            Ok(json) => self.publish(
                &reading_topic(machine, device, &sensor.spec.code),
                &json,
                false,
            ),
            Err(e) => debug!("Reading payload for {} not serializable: {}", sensor.spec.code, e),
        }
    }

    /// Retained system snapshot
    pub fn system(&self, topic: &str, payload: &Value) {
        self.publish(topic, payload, true);
    }

    pub fn publish(&self, topic: &str, payload: &Value, retain: bool) {
        if let Some(bus) = &self.bus {
            match serde_json::to_vec(payload) {
                Ok(bytes) => {
                    if let Err(e) = bus.publish(topic, bytes, retain) {
                        debug!("Bus publish dropped: {}", e);
                    }
                },
                Err(e) => debug!("Payload for {} not serializable: {}", topic, e),
            }
        }
        self.hub.broadcast(topic, payload);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Bus that keeps every message in memory
    #[derive(Default)]
    pub struct RecordingBus {
        pub messages: Mutex<Vec<(String, Value, bool)>>,
    }

    impl MessageBus for RecordingBus {
        fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
            let value = serde_json::from_slice(&payload)?;
            self.messages.lock().push((topic.to_string(), value, retain));
            Ok(())
        }

        fn status(&self) -> BusStatus {
            BusStatus {
                kind: "memory".to_string(),
                connected: true,
                host: None,
                port: None,
            }
        }
    }
}
