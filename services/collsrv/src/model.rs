//! Domain types: endpoints, machines, devices, sensors, readings, alarms

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::{
    decode_registers, display_value, engineering_value, ByteOrder, DisplayFormat, Encoding,
    FunctionCode, ReadRequest,
};
use crate::error::Result;

pub type MachineId = i64;
pub type DeviceId = i64;
pub type SensorId = i64;

/// One physical connection target shared by every device configured on it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub code: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Machine {
    pub id: MachineId,
    pub spec: MachineSpec,
}

/// Configurable part of a logical device (PLC)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub code: String,
    pub name: String,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub poll_interval_s: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: DeviceId,
    pub machine_id: MachineId,
    pub spec: DeviceSpec,
}

impl Device {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.spec.host.clone(), self.spec.port)
    }

    /// Poll cadence; a zero interval is treated as one second
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.spec.poll_interval_s.max(1))
    }
}

/// Alarm metadata of an `is_alarm` sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmSpec {
    pub severity: String,
    pub color: String,
}

impl Default for AlarmSpec {
    fn default() -> Self {
        Self {
            severity: "high".to_string(),
            color: "#FF0000".to_string(),
        }
    }
}

/// Configurable part of a sensor.
///
/// `address`, `function` and `encoding` fully determine the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub code: String,
    pub name: String,
    pub kind: String,
    pub unit: String,
    pub address: u16,
    pub function: FunctionCode,
    pub encoding: Encoding,
    pub byte_order: ByteOrder,
    pub scale_factor: f64,
    pub offset: f64,
    pub precision: Option<u32>,
    pub display: DisplayFormat,
    pub value_map: BTreeMap<String, String>,
    pub alarm: Option<AlarmSpec>,
}

impl SensorSpec {
    pub fn read_request(&self) -> Result<ReadRequest> {
        let count = if self.function.is_bit_access() {
            1
        } else {
            self.encoding.register_count()
        };
        ReadRequest::new(self.function, self.address, count)
    }

    /// Decode response words into `(raw, engineering value)`.
    ///
    /// Bit reads are reported as 0/1 without scaling.
    pub fn decode(&self, words: &[u16]) -> Result<(f64, f64)> {
        if self.function.is_bit_access() {
            let raw = if words.first().copied().unwrap_or(0) != 0 {
                1.0
            } else {
                0.0
            };
            return Ok((raw, raw));
        }
        let raw = decode_registers(self.encoding, self.byte_order, words)?;
        let value = engineering_value(raw, self.scale_factor, self.offset, self.precision);
        Ok((raw, value))
    }

    pub fn display(&self, value: f64) -> String {
        display_value(self.display, value, &self.value_map)
    }

    pub fn is_alarm(&self) -> bool {
        self.alarm.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sensor {
    pub id: SensorId,
    pub device_id: DeviceId,
    pub spec: SensorSpec,
}

/// Per-reading quality flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Quality {
    Good,
    ProtocolError,
}

impl Quality {
    pub fn code(self) -> i64 {
        match self {
            Quality::Good => 0,
            Quality::ProtocolError => 2,
        }
    }
}

/// Outcome of one sensor read
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub sensor_id: SensorId,
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
    pub raw_value: Option<f64>,
    pub quality: Quality,
}

impl Reading {
    pub fn good(sensor_id: SensorId, timestamp: DateTime<Utc>, raw: f64, value: f64) -> Self {
        Self {
            sensor_id,
            timestamp,
            value: Some(value),
            raw_value: Some(raw),
            quality: Quality::Good,
        }
    }

    pub fn failed(sensor_id: SensorId, timestamp: DateTime<Utc>) -> Self {
        Self {
            sensor_id,
            timestamp,
            value: None,
            raw_value: None,
            quality: Quality::ProtocolError,
        }
    }

    pub fn is_good(&self) -> bool {
        self.quality == Quality::Good && self.value.is_some()
    }

    /// Raw value as persisted: integer part when it fits in i32, else none
    pub fn stored_raw(&self) -> Option<i64> {
        self.raw_value
            .filter(|raw| raw.is_finite())
            .map(f64::trunc)
            .filter(|raw| *raw >= f64::from(i32::MIN) && *raw <= f64::from(i32::MAX))
            .map(|raw| raw as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmStatus {
    Open,
    Closed,
}

impl AlarmStatus {
    pub fn code(self) -> i64 {
        match self {
            AlarmStatus::Open => 1,
            AlarmStatus::Closed => 0,
        }
    }

    pub fn from_code(code: i64) -> Self {
        if code == 1 {
            AlarmStatus::Open
        } else {
            AlarmStatus::Closed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmRecord {
    pub id: i64,
    pub machine_id: MachineId,
    pub sensor_id: SensorId,
    pub alarm_code: String,
    pub alarm_name: String,
    pub severity: String,
    pub color: String,
    pub status: AlarmStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// An enabled device together with the machine it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAssignment {
    pub machine_id: MachineId,
    pub machine_code: String,
    pub device: Device,
}


#[cfg(test)]
mod tests {
    use super::fixtures::sensor_spec;
    use super::*;

    #[test]
    fn test_register_count_follows_encoding() {
        let spec = sensor_spec("t1", 10, Encoding::Float32);
        assert_eq!(spec.read_request().unwrap().count, 2);

        let mut coil = sensor_spec("c1", 3, Encoding::Float32);
        coil.function = FunctionCode::ReadCoils;
        assert_eq!(coil.read_request().unwrap().count, 1);
    }

    #[test]
    fn test_decode_applies_scale_offset_precision() {
        let mut spec = sensor_spec("t1", 10, Encoding::Int16);
        spec.scale_factor = 0.1;
        spec.offset = -5.0;
        spec.precision = Some(1);
        assert_eq!(spec.decode(&[250]).unwrap(), (250.0, 20.0));
    }

    #[test]
    fn test_coil_decode_is_unscaled() {
        let mut spec = sensor_spec("c1", 0, Encoding::Int16);
        spec.function = FunctionCode::ReadCoils;
        spec.scale_factor = 10.0;
        assert_eq!(spec.decode(&[1]).unwrap(), (1.0, 1.0));
        assert_eq!(spec.decode(&[0]).unwrap(), (0.0, 0.0));
    }

    #[test]
    fn test_stored_raw_clamps_to_i32() {
        let now = Utc::now();
        assert_eq!(Reading::good(1, now, 42.7, 42.7).stored_raw(), Some(42));
        assert_eq!(Reading::good(1, now, 4_000_000_000.0, 1.0).stored_raw(), None);
        assert_eq!(Reading::failed(1, now).stored_raw(), None);
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("10.0.0.5", 502).to_string(), "10.0.0.5:502");
    }
}
