//! Device reader: one task per endpoint, polling every device configured on it

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alarm::{AlarmDetector, AlarmOutcome};
use crate::error::{CollectorError, Result};
use crate::metrics::WriteStats;
use crate::model::{DeviceAssignment, DeviceId, Endpoint, MachineId, Reading, Sensor};
use crate::publish::Publisher;
use crate::store::ReadingStore;
use crate::transport::ModbusTcpClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkStatus {
    pub state: LinkState,
    pub last_error: Option<String>,
    pub since: DateTime<Utc>,
}

/// Connection state per endpoint, written by the owning reader
#[derive(Default)]
pub struct LinkRegistry {
    links: DashMap<Endpoint, LinkStatus>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, endpoint: &Endpoint, state: LinkState) {
        let now = Utc::now();
        self.links
            .entry(endpoint.clone())
            .and_modify(|link| {
                if link.state != state {
                    link.state = state;
                    link.since = now;
                }
            })
            .or_insert(LinkStatus {
                state,
                last_error: None,
                since: now,
            });
    }

    pub fn set_error(&self, endpoint: &Endpoint, error: &CollectorError) {
        self.set_state(endpoint, LinkState::Disconnected);
        if let Some(mut link) = self.links.get_mut(endpoint) {
            link.last_error = Some(error.to_string());
        }
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<LinkStatus> {
        self.links.get(endpoint).map(|link| link.clone())
    }

    pub fn remove(&self, endpoint: &Endpoint) {
        self.links.remove(endpoint);
    }

    pub fn snapshot(&self) -> BTreeMap<String, LinkStatus> {
        self.links
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().clone()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ReaderSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(3000),
            request_timeout: Duration::from_millis(2000),
            reconnect_delay: Duration::from_secs(60),
        }
    }
}

/// Collaborators shared by every reader
#[derive(Clone)]
pub struct ReaderContext {
    pub store: Arc<dyn ReadingStore>,
    pub publisher: Publisher,
    pub stats: Arc<WriteStats>,
    pub links: Arc<LinkRegistry>,
    pub settings: ReaderSettings,
}

/// Result of one device pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DevicePass {
    pub device_id: DeviceId,
    pub good: usize,
    pub failed: usize,
    pub persisted: bool,
    pub alarms_opened: usize,
    pub alarms_closed: usize,
}

pub struct DeviceReader {
    endpoint: Endpoint,
    assignments: Vec<DeviceAssignment>,
    ctx: ReaderContext,
    client: Option<ModbusTcpClient>,
}

impl DeviceReader {
    pub fn new(endpoint: Endpoint, assignments: Vec<DeviceAssignment>, ctx: ReaderContext) -> Self {
        Self {
            endpoint,
            assignments,
            ctx,
            client: None,
        }
    }

    /// Group cadence: the first device's poll interval
    pub fn cadence(&self) -> Duration {
        self.assignments
            .first()
            .map_or(Duration::from_secs(1), |a| a.device.poll_interval())
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Reader started for {} ({} devices, every {:?})",
            self.endpoint,
            self.assignments.len(),
            self.cadence()
        );

        'outer: while !cancel.is_cancelled() {
            if self.client.is_none() {
                if let Err(e) = self.connect().await {
                    warn!(
                        "{}: {}. Retrying in {:?}",
                        self.endpoint, e, self.ctx.settings.reconnect_delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.ctx.settings.reconnect_delay) => continue,
                    }
                }
            }

            for index in 0..self.assignments.len() {
                if cancel.is_cancelled() {
                    break 'outer;
                }
                let assignment = self.assignments[index].clone();
                self.poll_device(&assignment).await;
                if self.client.is_none() {
                    break;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.cadence()) => {},
            }
        }

        self.client = None;
        self.ctx.links.set_state(&self.endpoint, LinkState::Disconnected);
        info!("Reader stopped for {}", self.endpoint);
    }

    /// Connect if needed and run one pass over every assigned device
    pub async fn poll_once(&mut self) -> Result<Vec<DevicePass>> {
        if self.client.is_none() {
            self.connect().await?;
        }
        let mut passes = Vec::with_capacity(self.assignments.len());
        for assignment in self.assignments.clone() {
            passes.push(self.poll_device(&assignment).await);
        }
        Ok(passes)
    }

    async fn connect(&mut self) -> Result<()> {
        let links = &self.ctx.links;
        links.set_state(&self.endpoint, LinkState::Connecting);
        match ModbusTcpClient::connect(
            &self.endpoint,
            self.ctx.settings.connect_timeout,
            self.ctx.settings.request_timeout,
        )
        .await
        {
            Ok(client) => {
                self.client = Some(client);
                links.set_state(&self.endpoint, LinkState::Connected);
                Ok(())
            },
            Err(e) => {
                links.set_error(&self.endpoint, &e);
                Err(e)
            },
        }
    }

    fn drop_link(&mut self, error: &CollectorError) {
        if self.client.take().is_some() {
            warn!("{}: link lost: {}", self.endpoint, error);
        }
        self.ctx.links.set_error(&self.endpoint, error);
    }

    async fn read_sensor(&mut self, unit_id: u8, sensor: &Sensor) -> Result<(f64, f64)> {
        let request = sensor.spec.read_request()?;
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| CollectorError::connection("Not connected"))?;
        let words = client.read(unit_id, &request).await?;
        sensor.spec.decode(&words)
    }

    async fn poll_device(&mut self, assignment: &DeviceAssignment) -> DevicePass {
        let device = &assignment.device;
        let mut pass = DevicePass {
            device_id: device.id,
            ..Default::default()
        };

        let sensors = match self.ctx.store.sensors_for_device(device.id).await {
            Ok(sensors) => sensors,
            Err(e) => {
                warn!("[{}] sensor lookup failed: {}", device.spec.name, e);
                self.ctx.stats.record_failure(0, &e.to_string());
                return pass;
            },
        };

        let mut readings = Vec::with_capacity(sensors.len());
        for sensor in &sensors {
            let at = Utc::now();
            match self.read_sensor(device.spec.unit_id, sensor).await {
                Ok((raw, value)) => readings.push(Reading::good(sensor.id, at, raw, value)),
                Err(e) => {
                    debug!("[{}] {} read failed: {}", device.spec.name, sensor.spec.code, e);
                    self.ctx.stats.record_read_error();
                    readings.push(Reading::failed(sensor.id, at));
                    if e.is_link_error() {
                        self.drop_link(&e);
                    }
                },
            }
        }

        pass.good = readings.iter().filter(|r| r.is_good()).count();
        pass.failed = readings.len() - pass.good;

        if pass.good > 0 {
            let started = Instant::now();
            match persist(
                self.ctx.store.as_ref(),
                assignment.machine_id,
                &sensors,
                &readings,
            )
            .await
            {
                Ok(alarms) => {
                    self.ctx.stats.record_write(started.elapsed(), pass.good);
                    pass.persisted = true;
                    for (sensor, outcome) in alarms {
                        match outcome {
                            AlarmOutcome::Opened(id) => {
                                pass.alarms_opened += 1;
                                warn!(
                                    "ALARM RAISED: {} ({}) record {}",
                                    sensor.spec.name, assignment.machine_code, id
                                );
                            },
                            AlarmOutcome::Closed => {
                                pass.alarms_closed += 1;
                                info!(
                                    "ALARM CLEARED: {} ({})",
                                    sensor.spec.name, assignment.machine_code
                                );
                            },
                            AlarmOutcome::Unchanged => {},
                        }
                    }
                },
                Err(e) => {
                    warn!(
                        "[{}] persistence failed, skipping this cycle: {}",
                        device.spec.name, e
                    );
                    self.ctx.stats.record_failure(pass.good, &e.to_string());
                },
            }
        }

        let mut summary = Vec::with_capacity(pass.good);
        for (sensor, reading) in sensors.iter().zip(&readings) {
            let Some(value) = reading.value.filter(|_| reading.is_good()) else {
                continue;
            };
            self.ctx
                .publisher
                .reading(&assignment.machine_code, &device.spec.code, sensor, reading);
            summary.push(format!(
                "{}: {}{}",
                sensor.spec.name,
                sensor.spec.display(value),
                sensor.spec.unit
            ));
        }

        if pass.failed > 0 {
            summary.push(format!("{} failed", pass.failed));
        }
        if !summary.is_empty() {
            info!("[{}] {}", device.spec.name, summary.join(" | "));
        }
        pass
    }
}

/// Write one device pass atomically: readings, last values and alarm transitions
async fn persist<'a>(
    store: &dyn ReadingStore,
    machine_id: MachineId,
    sensors: &'a [Sensor],
    readings: &[Reading],
) -> Result<Vec<(&'a Sensor, AlarmOutcome)>> {
    let mut writer = store.begin_cycle().await?;
    let mut alarms = Vec::new();

    for (sensor, reading) in sensors.iter().zip(readings) {
        let Some(value) = reading.value.filter(|_| reading.is_good()) else {
            continue;
        };
        writer.append_reading(reading).await?;
        let previous = writer.upsert_last_value(reading).await?;
        if sensor.spec.is_alarm() {
            let outcome = AlarmDetector::evaluate(
                writer.as_mut(),
                machine_id,
                sensor,
                previous,
                value,
                reading.timestamp,
            )
            .await?;
            if outcome != AlarmOutcome::Unchanged {
                alarms.push((sensor, outcome));
            }
        }
    }

    writer.commit().await?;
    Ok(alarms)
}
