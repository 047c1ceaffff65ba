//! Shared store contract
//!
//! The reconciler, the readers and the metrics task each see the store
//! through their own trait. All writes of one device pass go through a
//! [`CycleWriter`], which commits them as a unit or not at all.

pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::model::{
    AlarmRecord, Device, DeviceAssignment, DeviceId, DeviceSpec, Machine, MachineId, MachineSpec,
    Reading, Sensor, SensorId, SensorSpec,
};

pub use sqlite::SqliteStore;

/// Roster CRUD used by the config reconciler
#[async_trait]
pub trait RosterStore: Send + Sync {
    async fn machines(&self) -> Result<Vec<Machine>>;
    async fn devices(&self) -> Result<Vec<Device>>;
    async fn sensors(&self) -> Result<Vec<Sensor>>;

    async fn insert_machine(&self, spec: &MachineSpec) -> Result<MachineId>;
    async fn update_machine(&self, id: MachineId, spec: &MachineSpec) -> Result<()>;
    async fn delete_machine(&self, id: MachineId) -> Result<()>;

    async fn insert_device(&self, machine_id: MachineId, spec: &DeviceSpec) -> Result<DeviceId>;
    async fn update_device(&self, id: DeviceId, spec: &DeviceSpec) -> Result<()>;
    async fn set_device_enabled(&self, id: DeviceId, enabled: bool) -> Result<()>;
    async fn delete_device(&self, id: DeviceId) -> Result<()>;

    async fn insert_sensor(&self, device_id: DeviceId, spec: &SensorSpec) -> Result<SensorId>;
    async fn update_sensor(&self, id: SensorId, spec: &SensorSpec) -> Result<()>;
    /// Removes the sensor together with its readings, last value and alarms
    async fn delete_sensor(&self, id: SensorId) -> Result<()>;

    /// Enabled devices joined with their machine, ordered by device id
    async fn enabled_assignments(&self) -> Result<Vec<DeviceAssignment>>;
}

/// Reader-side access
#[async_trait]
pub trait ReadingStore: Send + Sync {
    async fn sensors_for_device(&self, device_id: DeviceId) -> Result<Vec<Sensor>>;

    /// Start the atomic write batch of one device pass
    async fn begin_cycle(&self) -> Result<Box<dyn CycleWriter>>;
}

/// Alarm row to insert when a sensor goes from inactive to active
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlarm {
    pub machine_id: MachineId,
    pub sensor_id: SensorId,
    pub alarm_code: String,
    pub alarm_name: String,
    pub severity: String,
    pub color: String,
    pub opened_at: DateTime<Utc>,
}

/// Writes of one device pass. Dropping the writer without `commit` discards them.
#[async_trait]
pub trait CycleWriter: Send {
    async fn append_reading(&mut self, reading: &Reading) -> Result<()>;

    /// Overwrite the last value and return the one it replaced
    async fn upsert_last_value(&mut self, reading: &Reading) -> Result<Option<f64>>;

    async fn has_open_alarm(&mut self, sensor_id: SensorId, alarm_code: &str) -> Result<bool>;
    async fn open_alarm(&mut self, alarm: &NewAlarm) -> Result<i64>;

    /// Stamp the close time of the open record; false when none was open
    async fn close_alarm(
        &mut self,
        sensor_id: SensorId,
        alarm_code: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub total: u32,
    pub idle: u32,
    pub active: u32,
}

/// Store snapshot for the `system/database` topic
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub status: String,
    pub engine: String,
    pub version: Option<String>,
    pub connections: ConnectionStats,
    pub size_bytes: i64,
    pub size_mb: f64,
    pub tables: BTreeMap<String, i64>,
    pub cache_hit_ratio: Option<f64>,
    pub locks: Option<i64>,
}

#[async_trait]
pub trait StoreIntrospection: Send + Sync {
    async fn introspect(&self) -> Result<StoreStats>;
    async fn active_alarms(&self) -> Result<Vec<AlarmRecord>>;
}
