//! SQLite binding of the shared store

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::sqlite::{SqliteClient, SqliteOptions, SqlitePool};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, info};

use super::{
    ConnectionStats, CycleWriter, NewAlarm, ReadingStore, RosterStore, StoreIntrospection,
    StoreStats,
};
use crate::codec::{ByteOrder, DisplayFormat, Encoding, FunctionCode};
use crate::error::{CollectorError, Result};
use crate::model::{
    AlarmRecord, AlarmSpec, AlarmStatus, Device, DeviceAssignment, DeviceId, DeviceSpec, Machine,
    MachineId, MachineSpec, Reading, Sensor, SensorId, SensorSpec,
};

pub const MACHINES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS machines (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        code TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        description TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
"#;

pub const DEVICES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS devices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        machine_id INTEGER NOT NULL REFERENCES machines(id),
        code TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        protocol TEXT NOT NULL,
        ip_address TEXT NOT NULL,
        port INTEGER NOT NULL DEFAULT 502,
        unit_id INTEGER NOT NULL DEFAULT 1,
        poll_interval_s INTEGER NOT NULL DEFAULT 1,
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
"#;

pub const SENSORS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS sensors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id INTEGER NOT NULL REFERENCES devices(id),
        code TEXT NOT NULL,
        name TEXT NOT NULL,
        type TEXT NOT NULL DEFAULT '',
        unit TEXT NOT NULL DEFAULT '',
        address INTEGER NOT NULL,
        function_code INTEGER NOT NULL DEFAULT 3,
        data_type TEXT NOT NULL DEFAULT 'int16',
        swap TEXT NOT NULL DEFAULT 'ABCD',
        scale_factor REAL NOT NULL DEFAULT 1.0,
        offset REAL NOT NULL DEFAULT 0.0,
        precision INTEGER,
        display_format TEXT NOT NULL DEFAULT 'raw',
        value_map TEXT NOT NULL DEFAULT '{}',
        is_alarm INTEGER NOT NULL DEFAULT 0,
        severity TEXT,
        color TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (device_id, code)
    )
"#;

pub const SENSOR_DATA_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS sensor_data (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sensor_id INTEGER NOT NULL REFERENCES sensors(id),
        timestamp TEXT NOT NULL,
        value REAL NOT NULL,
        quality INTEGER NOT NULL DEFAULT 0,
        raw_value INTEGER
    )
"#;

pub const SENSOR_LAST_VALUE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS sensor_last_value (
        sensor_id INTEGER PRIMARY KEY REFERENCES sensors(id),
        timestamp TEXT NOT NULL,
        value REAL NOT NULL,
        quality INTEGER NOT NULL DEFAULT 0
    )
"#;

pub const MACHINE_ALARMS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS machine_alarms (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        machine_id INTEGER NOT NULL REFERENCES machines(id),
        sensor_id INTEGER NOT NULL REFERENCES sensors(id),
        alarm_code TEXT NOT NULL,
        alarm_name TEXT NOT NULL,
        severity TEXT NOT NULL,
        color TEXT NOT NULL,
        status INTEGER NOT NULL DEFAULT 1,
        timestamp_on TEXT NOT NULL,
        timestamp_off TEXT
    )
"#;

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_sensor_data_sensor_ts ON sensor_data (sensor_id, timestamp)",
    // at most one open record per (sensor, alarm_code)
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_machine_alarms_open \
     ON machine_alarms (sensor_id, alarm_code) WHERE timestamp_off IS NULL",
];

/// Tables reported by introspection
const TABLES: &[&str] = &[
    "machines",
    "devices",
    "sensors",
    "sensor_data",
    "sensor_last_value",
    "machine_alarms",
];

const SENSOR_COLUMNS: &str = "id, device_id, code, name, type, unit, address, function_code, \
     data_type, swap, scale_factor, offset, precision, display_format, value_map, is_alarm, \
     severity, color";

const ALARM_COLUMNS: &str = "id, machine_id, sensor_id, alarm_code, alarm_name, severity, color, \
     status, timestamp_on, timestamp_off";

/// Last-value row of one sensor
#[derive(Debug, Clone, PartialEq)]
pub struct LastValue {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub quality: i64,
}

#[derive(Clone)]
pub struct SqliteStore {
    client: SqliteClient,
}

impl SqliteStore {
    /// Open the database file and create missing tables
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, SqliteOptions::default()).await
    }

    pub async fn open_with(path: impl AsRef<Path>, options: SqliteOptions) -> Result<Self> {
        let client = SqliteClient::with_options(path, options)
            .await
            .map_err(|e| CollectorError::storage(format!("{:#}", e)))?;
        let store = Self { client };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> Result<()> {
        for ddl in [
            MACHINES_TABLE,
            DEVICES_TABLE,
            SENSORS_TABLE,
            SENSOR_DATA_TABLE,
            SENSOR_LAST_VALUE_TABLE,
            MACHINE_ALARMS_TABLE,
        ] {
            sqlx::query(ddl).execute(self.pool()).await?;
        }
        for index in INDEXES {
            sqlx::query(index).execute(self.pool()).await?;
        }
        debug!("Collector schema initialized at {}", self.client.path());
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        self.client.pool()
    }

    pub async fn close(&self) {
        self.client.close().await;
    }

    pub async fn last_value(&self, sensor_id: SensorId) -> Result<Option<LastValue>> {
        let row = sqlx::query(
            "SELECT timestamp, value, quality FROM sensor_last_value WHERE sensor_id = ?",
        )
        .bind(sensor_id)
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(LastValue {
            timestamp: row.try_get("timestamp")?,
            value: row.try_get("value")?,
            quality: row.try_get("quality")?,
        }))
    }

    pub async fn reading_count(&self, sensor_id: SensorId) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sensor_data WHERE sensor_id = ?")
                .bind(sensor_id)
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }

    /// Every alarm record of a sensor, oldest first
    pub async fn alarms_for_sensor(&self, sensor_id: SensorId) -> Result<Vec<AlarmRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM machine_alarms WHERE sensor_id = ? ORDER BY id",
            ALARM_COLUMNS
        ))
        .bind(sensor_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(alarm_from_row).collect()
    }
}

fn machine_from_row(row: &SqliteRow) -> Result<Machine> {
    Ok(Machine {
        id: row.try_get("id")?,
        spec: MachineSpec {
            code: row.try_get("code")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
        },
    })
}

fn device_from_row(row: &SqliteRow) -> Result<Device> {
    let port: i64 = row.try_get("port")?;
    let unit_id: i64 = row.try_get("unit_id")?;
    let poll_interval_s: i64 = row.try_get("poll_interval_s")?;
    Ok(Device {
        id: row.try_get("id")?,
        machine_id: row.try_get("machine_id")?,
        spec: DeviceSpec {
            code: row.try_get("code")?,
            name: row.try_get("name")?,
            protocol: row.try_get("protocol")?,
            host: row.try_get("ip_address")?,
            port: port as u16,
            unit_id: unit_id as u8,
            poll_interval_s: poll_interval_s.max(0) as u64,
            enabled: row.try_get("enabled")?,
        },
    })
}

fn sensor_from_row(row: &SqliteRow) -> Result<Sensor> {
    let address: i64 = row.try_get("address")?;
    let function_code: i64 = row.try_get("function_code")?;
    let data_type: String = row.try_get("data_type")?;
    let swap: String = row.try_get("swap")?;
    let display_format: String = row.try_get("display_format")?;
    let value_map: String = row.try_get("value_map")?;
    let precision: Option<i64> = row.try_get("precision")?;
    let is_alarm: bool = row.try_get("is_alarm")?;

    let alarm = if is_alarm {
        let defaults = AlarmSpec::default();
        let severity: Option<String> = row.try_get("severity")?;
        let color: Option<String> = row.try_get("color")?;
        Some(AlarmSpec {
            severity: severity.unwrap_or(defaults.severity),
            color: color.unwrap_or(defaults.color),
        })
    } else {
        None
    };

    Ok(Sensor {
        id: row.try_get("id")?,
        device_id: row.try_get("device_id")?,
        spec: SensorSpec {
            code: row.try_get("code")?,
            name: row.try_get("name")?,
            kind: row.try_get("type")?,
            unit: row.try_get("unit")?,
            address: address as u16,
            function: FunctionCode::try_from(function_code as u8)?,
            encoding: data_type.parse::<Encoding>()?,
            byte_order: swap.parse::<ByteOrder>()?,
            scale_factor: row.try_get("scale_factor")?,
            offset: row.try_get("offset")?,
            precision: precision.map(|p| p.max(0) as u32),
            display: display_format.parse::<DisplayFormat>()?,
            value_map: serde_json::from_str::<BTreeMap<String, String>>(&value_map)?,
            alarm,
        },
    })
}

fn alarm_from_row(row: &SqliteRow) -> Result<AlarmRecord> {
    let status: i64 = row.try_get("status")?;
    Ok(AlarmRecord {
        id: row.try_get("id")?,
        machine_id: row.try_get("machine_id")?,
        sensor_id: row.try_get("sensor_id")?,
        alarm_code: row.try_get("alarm_code")?,
        alarm_name: row.try_get("alarm_name")?,
        severity: row.try_get("severity")?,
        color: row.try_get("color")?,
        status: AlarmStatus::from_code(status),
        opened_at: row.try_get("timestamp_on")?,
        closed_at: row.try_get("timestamp_off")?,
    })
}

#[async_trait]
impl RosterStore for SqliteStore {
    async fn machines(&self) -> Result<Vec<Machine>> {
        let rows = sqlx::query("SELECT id, code, name, description FROM machines ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(machine_from_row).collect()
    }

    async fn devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query("SELECT * FROM devices ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(device_from_row).collect()
    }

    async fn sensors(&self) -> Result<Vec<Sensor>> {
        let rows = sqlx::query(&format!("SELECT {} FROM sensors ORDER BY id", SENSOR_COLUMNS))
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(sensor_from_row).collect()
    }

    async fn insert_machine(&self, spec: &MachineSpec) -> Result<MachineId> {
        let result = sqlx::query("INSERT INTO machines (code, name, description) VALUES (?, ?, ?)")
            .bind(&spec.code)
            .bind(&spec.name)
            .bind(&spec.description)
            .execute(self.pool())
            .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_machine(&self, id: MachineId, spec: &MachineSpec) -> Result<()> {
        sqlx::query(
            "UPDATE machines SET name = ?, description = ?, updated_at = CURRENT_TIMESTAMP \
             WHERE id = ?",
        )
        .bind(&spec.name)
        .bind(&spec.description)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn delete_machine(&self, id: MachineId) -> Result<()> {
        sqlx::query("DELETE FROM machines WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn insert_device(&self, machine_id: MachineId, spec: &DeviceSpec) -> Result<DeviceId> {
        let result = sqlx::query(
            "INSERT INTO devices (machine_id, code, name, protocol, ip_address, port, unit_id, \
             poll_interval_s, enabled) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(machine_id)
        .bind(&spec.code)
        .bind(&spec.name)
        .bind(&spec.protocol)
        .bind(&spec.host)
        .bind(i64::from(spec.port))
        .bind(i64::from(spec.unit_id))
        .bind(spec.poll_interval_s as i64)
        .bind(spec.enabled)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_device(&self, id: DeviceId, spec: &DeviceSpec) -> Result<()> {
        sqlx::query(
            "UPDATE devices SET name = ?, protocol = ?, ip_address = ?, port = ?, unit_id = ?, \
             poll_interval_s = ?, enabled = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(&spec.name)
        .bind(&spec.protocol)
        .bind(&spec.host)
        .bind(i64::from(spec.port))
        .bind(i64::from(spec.unit_id))
        .bind(spec.poll_interval_s as i64)
        .bind(spec.enabled)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn set_device_enabled(&self, id: DeviceId, enabled: bool) -> Result<()> {
        sqlx::query(
            "UPDATE devices SET enabled = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(enabled)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn delete_device(&self, id: DeviceId) -> Result<()> {
        sqlx::query("DELETE FROM devices WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn insert_sensor(&self, device_id: DeviceId, spec: &SensorSpec) -> Result<SensorId> {
        let alarm = spec.alarm.as_ref();
        let result = sqlx::query(
            "INSERT INTO sensors (device_id, code, name, type, unit, address, function_code, \
             data_type, swap, scale_factor, offset, precision, display_format, value_map, \
             is_alarm, severity, color) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(device_id)
        .bind(&spec.code)
        .bind(&spec.name)
        .bind(&spec.kind)
        .bind(&spec.unit)
        .bind(i64::from(spec.address))
        .bind(i64::from(spec.function.code()))
        .bind(spec.encoding.as_str())
        .bind(spec.byte_order.as_str())
        .bind(spec.scale_factor)
        .bind(spec.offset)
        .bind(spec.precision.map(i64::from))
        .bind(spec.display.as_str())
        .bind(serde_json::to_string(&spec.value_map)?)
        .bind(alarm.is_some())
        .bind(alarm.map(|a| a.severity.clone()))
        .bind(alarm.map(|a| a.color.clone()))
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_sensor(&self, id: SensorId, spec: &SensorSpec) -> Result<()> {
        let alarm = spec.alarm.as_ref();
        sqlx::query(
            "UPDATE sensors SET name = ?, type = ?, unit = ?, address = ?, function_code = ?, \
             data_type = ?, swap = ?, scale_factor = ?, offset = ?, precision = ?, \
             display_format = ?, value_map = ?, is_alarm = ?, severity = ?, color = ?, \
             updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(&spec.name)
        .bind(&spec.kind)
        .bind(&spec.unit)
        .bind(i64::from(spec.address))
        .bind(i64::from(spec.function.code()))
        .bind(spec.encoding.as_str())
        .bind(spec.byte_order.as_str())
        .bind(spec.scale_factor)
        .bind(spec.offset)
        .bind(spec.precision.map(i64::from))
        .bind(spec.display.as_str())
        .bind(serde_json::to_string(&spec.value_map)?)
        .bind(alarm.is_some())
        .bind(alarm.map(|a| a.severity.clone()))
        .bind(alarm.map(|a| a.color.clone()))
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn delete_sensor(&self, id: SensorId) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        for sql in [
            "DELETE FROM sensor_data WHERE sensor_id = ?",
            "DELETE FROM sensor_last_value WHERE sensor_id = ?",
            "DELETE FROM machine_alarms WHERE sensor_id = ?",
            "DELETE FROM sensors WHERE id = ?",
        ] {
            sqlx::query(sql).bind(id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn enabled_assignments(&self) -> Result<Vec<DeviceAssignment>> {
        let rows = sqlx::query(
            "SELECT d.*, m.code AS machine_code FROM devices d \
             JOIN machines m ON m.id = d.machine_id \
             WHERE d.enabled = 1 ORDER BY d.id",
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| -> Result<DeviceAssignment> {
                let device = device_from_row(row)?;
                Ok(DeviceAssignment {
                    machine_id: device.machine_id,
                    machine_code: row.try_get("machine_code")?,
                    device,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ReadingStore for SqliteStore {
    async fn sensors_for_device(&self, device_id: DeviceId) -> Result<Vec<Sensor>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sensors WHERE device_id = ? ORDER BY id",
            SENSOR_COLUMNS
        ))
        .bind(device_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(sensor_from_row).collect()
    }

    async fn begin_cycle(&self) -> Result<Box<dyn CycleWriter>> {
        let tx = self.pool().begin().await?;
        Ok(Box::new(SqliteCycle { tx }))
    }
}

/// One device pass inside a SQLite transaction
struct SqliteCycle {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl CycleWriter for SqliteCycle {
    async fn append_reading(&mut self, reading: &Reading) -> Result<()> {
        let value = reading
            .value
            .ok_or_else(|| CollectorError::data("Reading without value cannot be stored"))?;
        sqlx::query(
            "INSERT INTO sensor_data (sensor_id, timestamp, value, quality, raw_value) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(reading.sensor_id)
        .bind(reading.timestamp)
        .bind(value)
        .bind(reading.quality.code())
        .bind(reading.stored_raw())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_last_value(&mut self, reading: &Reading) -> Result<Option<f64>> {
        let value = reading
            .value
            .ok_or_else(|| CollectorError::data("Reading without value cannot be cached"))?;

        let previous: Option<f64> =
            sqlx::query_scalar("SELECT value FROM sensor_last_value WHERE sensor_id = ?")
                .bind(reading.sensor_id)
                .fetch_optional(&mut *self.tx)
                .await?;

        sqlx::query(
            "INSERT INTO sensor_last_value (sensor_id, timestamp, value, quality) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (sensor_id) DO UPDATE SET \
             timestamp = excluded.timestamp, value = excluded.value, quality = excluded.quality",
        )
        .bind(reading.sensor_id)
        .bind(reading.timestamp)
        .bind(value)
        .bind(reading.quality.code())
        .execute(&mut *self.tx)
        .await?;

        Ok(previous)
    }

    async fn has_open_alarm(&mut self, sensor_id: SensorId, alarm_code: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM machine_alarms \
             WHERE sensor_id = ? AND alarm_code = ? AND timestamp_off IS NULL",
        )
        .bind(sensor_id)
        .bind(alarm_code)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count > 0)
    }

    async fn open_alarm(&mut self, alarm: &NewAlarm) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO machine_alarms (machine_id, sensor_id, alarm_code, alarm_name, \
             severity, color, status, timestamp_on, timestamp_off) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL)",
        )
        .bind(alarm.machine_id)
        .bind(alarm.sensor_id)
        .bind(&alarm.alarm_code)
        .bind(&alarm.alarm_name)
        .bind(&alarm.severity)
        .bind(&alarm.color)
        .bind(AlarmStatus::Open.code())
        .bind(alarm.opened_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn close_alarm(
        &mut self,
        sensor_id: SensorId,
        alarm_code: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE machine_alarms SET status = ?, timestamp_off = ? \
             WHERE sensor_id = ? AND alarm_code = ? AND timestamp_off IS NULL",
        )
        .bind(AlarmStatus::Closed.code())
        .bind(at)
        .bind(sensor_id)
        .bind(alarm_code)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl StoreIntrospection for SqliteStore {
    async fn introspect(&self) -> Result<StoreStats> {
        if let Err(e) = self.client.ping().await {
            return Ok(StoreStats {
                status: format!("error: {}", e),
                engine: "sqlite".to_string(),
                ..Default::default()
            });
        }

        let size_bytes = self
            .client
            .size_bytes()
            .await
            .map_err(|e| CollectorError::storage(e.to_string()))?;
        let version = self.client.version().await.ok();

        let mut tables = BTreeMap::new();
        for table in TABLES {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(self.pool())
                .await?;
            tables.insert((*table).to_string(), count);
        }

        let total = self.pool().size();
        let idle = self.pool().num_idle() as u32;

        Ok(StoreStats {
            status: "online".to_string(),
            engine: "sqlite".to_string(),
            version,
            connections: ConnectionStats {
                total,
                idle,
                active: total.saturating_sub(idle),
            },
            size_bytes,
            size_mb: (size_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0,
            tables,
            cache_hit_ratio: None,
            locks: None,
        })
    }

    async fn active_alarms(&self) -> Result<Vec<AlarmRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM machine_alarms WHERE timestamp_off IS NULL ORDER BY timestamp_on DESC",
            ALARM_COLUMNS
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(alarm_from_row).collect()
    }
}

impl SqliteStore {
    /// Log-friendly one-line summary of the roster size
    pub async fn log_roster_summary(&self) -> Result<()> {
        let machines: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM machines")
            .fetch_one(self.pool())
            .await?;
        let devices: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices WHERE enabled = 1")
            .fetch_one(self.pool())
            .await?;
        let sensors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensors")
            .fetch_one(self.pool())
            .await?;
        info!(
            "Roster: {} machines, {} enabled devices, {} sensors",
            machines, devices, sensors
        );
        Ok(())
    }
}
