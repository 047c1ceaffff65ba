//! Machine definition files
//!
//! Layout under the config root:
//!
//! ```text
//! settings.yml          optional; `machines:` lists files, `mqtt:` overrides the broker
//! machines/*.yml        one machine per file, used when `machines:` is absent
//! *.yml                 fallback when there is no machines/ directory
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tracing::{debug, info, warn};

use crate::codec::{ByteOrder, DisplayFormat, Encoding, FunctionCode};
use crate::error::{CollectorError, Result};
use crate::model::{AlarmSpec, DeviceSpec, MachineSpec, SensorSpec};

pub const SETTINGS_FILE: &str = "settings.yml";
pub const MACHINES_DIR: &str = "machines";

const SUPPORTED_PROTOCOLS: &[&str] = &["modbus", "modbus_tcp", "modbustcp"];

fn default_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_poll_interval() -> u64 {
    1
}

fn default_function_code() -> u8 {
    3
}

fn default_scale() -> f64 {
    1.0
}

fn default_data_type() -> String {
    "int16".to_string()
}

fn default_precision() -> Option<u32> {
    Some(2)
}

#[derive(Debug, Deserialize)]
struct MachineFile {
    machine: MachineSection,
    plc: PlcSection,
    #[serde(default)]
    sensors: Vec<SensorSection>,
}

#[derive(Debug, Deserialize)]
struct MachineSection {
    code: String,
    name: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlcSection {
    code: String,
    name: String,
    protocol: String,
    ip_address: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_unit_id")]
    unit_id: u8,
    #[serde(default = "default_poll_interval")]
    poll_interval_s: u64,
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SensorSection {
    code: String,
    name: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    unit: String,
    address: u16,
    #[serde(default = "default_function_code")]
    function_code: u8,
    #[serde(default = "default_scale")]
    scale_factor: f64,
    #[serde(default)]
    offset: f64,
    #[serde(default = "default_data_type")]
    data_type: String,
    #[serde(default = "default_precision")]
    precision: Option<u32>,
    swap: Option<String>,
    display_format: Option<String>,
    value_map: Option<Mapping>,
    #[serde(default)]
    is_alarm: bool,
    severity: Option<String>,
    color: Option<String>,
}

/// One resolved machine file
#[derive(Debug, Clone, PartialEq)]
pub struct MachineDefinition {
    pub file: PathBuf,
    pub machine: MachineSpec,
    pub device: DeviceSpec,
    /// `enabled` as written in the file; absent means keep the stored flag
    pub enabled: Option<bool>,
    pub sensors: Vec<SensorSpec>,
}

/// Broker override from settings.yml
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MqttOverride {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    /// `None` when the key is absent; an explicit null or empty list means no machines
    pub machines: Option<Vec<String>>,
    pub mqtt: Option<MqttOverride>,
}

/// Result of loading every machine file
#[derive(Debug, Default)]
pub struct LoadedConfig {
    pub definitions: Vec<MachineDefinition>,
    pub failures: Vec<(PathBuf, CollectorError)>,
}

impl LoadedConfig {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

fn yaml_scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(match n.as_i64() {
            Some(i) => i.to_string(),
            None => n.to_string(),
        }),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn convert_value_map(map: &Mapping) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (key, label) in map {
        let key = yaml_scalar_to_string(key)
            .ok_or_else(|| CollectorError::config(format!("Invalid value_map key: {:?}", key)))?;
        let label = yaml_scalar_to_string(label).ok_or_else(|| {
            CollectorError::config(format!("Invalid value_map label for {}", key))
        })?;
        out.insert(key, label);
    }
    Ok(out)
}

fn convert_sensor(section: SensorSection) -> Result<SensorSpec> {
    let context = |e: CollectorError| CollectorError::config(format!("sensor {}: {}", section.code, e));

    let function = FunctionCode::try_from(section.function_code).map_err(context)?;
    let encoding = section.data_type.parse::<Encoding>().map_err(context)?;
    let byte_order = match section.swap.as_deref() {
        Some(swap) => swap.parse::<ByteOrder>().map_err(context)?,
        None => ByteOrder::default(),
    };
    let display = match section.display_format.as_deref() {
        Some(format) => format.parse::<DisplayFormat>().map_err(context)?,
        None => DisplayFormat::default(),
    };
    let value_map = match &section.value_map {
        Some(map) => convert_value_map(map).map_err(context)?,
        None => BTreeMap::new(),
    };
    let alarm = section.is_alarm.then(|| {
        let defaults = AlarmSpec::default();
        AlarmSpec {
            severity: section.severity.clone().unwrap_or(defaults.severity),
            color: section.color.clone().unwrap_or(defaults.color),
        }
    });

    let spec = SensorSpec {
        code: section.code,
        name: section.name,
        kind: section.kind,
        unit: section.unit,
        address: section.address,
        function,
        encoding,
        byte_order,
        scale_factor: section.scale_factor,
        offset: section.offset,
        precision: section.precision,
        display,
        value_map,
        alarm,
    };
    spec.read_request()
        .map_err(|e| CollectorError::config(format!("sensor {}: {}", spec.code, e)))?;
    Ok(spec)
}

/// Parse one machine file's contents
pub fn parse_machine_file(file: &Path, text: &str) -> Result<MachineDefinition> {
    let parsed: MachineFile = serde_yaml::from_str(text)?;

    let protocol = parsed.plc.protocol.trim().to_ascii_lowercase();
    if !SUPPORTED_PROTOCOLS.contains(&protocol.as_str()) {
        return Err(CollectorError::config(format!(
            "Unsupported protocol '{}' for PLC {}",
            parsed.plc.protocol, parsed.plc.code
        )));
    }
    if parsed.plc.ip_address.trim().is_empty() {
        return Err(CollectorError::config(format!(
            "PLC {} has no ip_address",
            parsed.plc.code
        )));
    }

    let mut seen = HashSet::new();
    let mut sensors = Vec::with_capacity(parsed.sensors.len());
    for section in parsed.sensors {
        if !seen.insert(section.code.clone()) {
            return Err(CollectorError::config(format!(
                "Duplicate sensor code '{}'",
                section.code
            )));
        }
        sensors.push(convert_sensor(section)?);
    }

    Ok(MachineDefinition {
        file: file.to_path_buf(),
        machine: MachineSpec {
            code: parsed.machine.code,
            name: parsed.machine.name,
            description: parsed.machine.description,
        },
        device: DeviceSpec {
            code: parsed.plc.code,
            name: parsed.plc.name,
            protocol,
            host: parsed.plc.ip_address.trim().to_string(),
            port: parsed.plc.port,
            unit_id: parsed.plc.unit_id,
            poll_interval_s: parsed.plc.poll_interval_s,
            enabled: parsed.plc.enabled.unwrap_or(true),
        },
        enabled: parsed.plc.enabled,
        sensors,
    })
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    )
}

fn yaml_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_yaml(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Machine definition tree rooted at one directory
#[derive(Debug, Clone)]
pub struct ConfigSource {
    root: PathBuf,
}

impl ConfigSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn settings_path(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    pub fn settings(&self) -> Result<Settings> {
        let path = self.settings_path();
        if !path.exists() {
            return Ok(Settings::default());
        }
        let text = fs::read_to_string(&path)?;
        let value: Value = serde_yaml::from_str(&text)?;
        let Value::Mapping(map) = value else {
            return Ok(Settings::default());
        };

        let machines = match map.get("machines") {
            None => None,
            Some(Value::Null) => Some(Vec::new()),
            Some(Value::Sequence(items)) => Some(
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect(),
            ),
            Some(other) => {
                return Err(CollectorError::config(format!(
                    "settings.yml: 'machines' must be a list, got {:?}",
                    other
                )))
            },
        };
        let mqtt = match map.get("mqtt") {
            Some(value) if !value.is_null() => Some(serde_yaml::from_value(value.clone())?),
            _ => None,
        };
        Ok(Settings { machines, mqtt })
    }

    /// Files to load, in a stable order
    pub fn machine_files(&self) -> Result<Vec<PathBuf>> {
        if let Some(listed) = self.settings()?.machines {
            if listed.is_empty() {
                info!("Machines list is empty in {}", SETTINGS_FILE);
            }
            return Ok(listed.iter().map(|f| self.root.join(f)).collect());
        }

        let machines_dir = self.root.join(MACHINES_DIR);
        if machines_dir.is_dir() {
            return yaml_files_in(&machines_dir);
        }
        Ok(yaml_files_in(&self.root)?
            .into_iter()
            .filter(|p| p.file_name().and_then(|n| n.to_str()) != Some(SETTINGS_FILE))
            .collect())
    }

    /// Load every machine file. Bad files are reported, not fatal.
    ///
    /// Errors only when the root itself or settings.yml cannot be read.
    pub fn load(&self) -> Result<LoadedConfig> {
        if !self.root.is_dir() {
            return Err(CollectorError::config(format!(
                "Config path {} does not exist",
                self.root.display()
            )));
        }

        let mut loaded = LoadedConfig::default();
        let mut machine_codes = HashSet::new();
        let mut device_codes = HashSet::new();

        for file in self.machine_files()? {
            let result = fs::read_to_string(&file)
                .map_err(|e| CollectorError::config(format!("{}: {}", file.display(), e)))
                .and_then(|text| parse_machine_file(&file, &text));
            match result {
                Ok(def) => {
                    if !machine_codes.insert(def.machine.code.clone()) {
                        let err = CollectorError::config(format!(
                            "Machine code '{}' defined twice",
                            def.machine.code
                        ));
                        warn!("Skipping {}: {}", file.display(), err);
                        loaded.failures.push((file, err));
                    } else if !device_codes.insert(def.device.code.clone()) {
                        let err = CollectorError::config(format!(
                            "PLC code '{}' defined twice",
                            def.device.code
                        ));
                        warn!("Skipping {}: {}", file.display(), err);
                        loaded.failures.push((file, err));
                    } else {
                        debug!(
                            "Loaded {}: machine {} with {} sensors",
                            file.display(),
                            def.machine.code,
                            def.sensors.len()
                        );
                        loaded.definitions.push(def);
                    }
                },
                Err(e) => {
                    warn!("Skipping {}: {}", file.display(), e);
                    loaded.failures.push((file, e));
                },
            }
        }
        Ok(loaded)
    }

    /// Newest modification time over settings, root YAML files, machine files
    /// and the directories holding them. Directory mtimes move when a file is
    /// unlinked, so removals count as changes.
    pub fn mtime(&self) -> Option<SystemTime> {
        let mut candidates = vec![
            self.settings_path(),
            self.root.clone(),
            self.root.join(MACHINES_DIR),
        ];
        if let Ok(files) = yaml_files_in(&self.root) {
            candidates.extend(files);
        }
        if let Ok(files) = self.machine_files() {
            candidates.extend(files);
        }
        candidates.iter().filter_map(|p| modified(p)).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRESS: &str = r##"
machine:
  code: sec21
  name: Press 21
plc:
  code: plc1
  name: Press PLC
  protocol: modbus
  ip_address: 192.168.1.10
  poll_interval_s: 2
sensors:
  - code: temp
    name: Oil temperature
    type: temperature
    unit: C
    address: 100
    function_code: 3
    data_type: float32
    swap: word
    scale_factor: 0.1
  - code: mode
    name: Mode
    type: program
    unit: ""
    address: 7
    function_code: 3
    display_format: mapped
    value_map:
      0: STOP
      1: AUTO
  - code: door_open
    name: Door open
    type: boolean
    unit: ""
    address: 3
    function_code: 1
    is_alarm: true
    severity: medium
"##;

    #[test]
    fn test_parse_applies_defaults() {
        let def = parse_machine_file(Path::new("press.yml"), PRESS).unwrap();
        assert_eq!(def.machine.code, "sec21");
        assert_eq!(def.device.port, 502);
        assert_eq!(def.device.unit_id, 1);
        assert_eq!(def.device.poll_interval_s, 2);
        assert!(def.device.enabled);
        assert_eq!(def.enabled, None);

        let temp = &def.sensors[0];
        assert_eq!(temp.encoding, Encoding::Float32);
        assert_eq!(temp.byte_order, ByteOrder::WordSwap);
        assert_eq!(temp.precision, Some(2));

        let mode = &def.sensors[1];
        assert_eq!(mode.display, DisplayFormat::Mapped);
        assert_eq!(mode.value_map.get("1").map(String::as_str), Some("AUTO"));

        let door = &def.sensors[2];
        assert_eq!(door.function, FunctionCode::ReadCoils);
        let alarm = door.alarm.as_ref().unwrap();
        assert_eq!(alarm.severity, "medium");
        assert_eq!(alarm.color, "#FF0000");
    }

    #[test]
    fn test_rejects_unknown_protocol() {
        let text = PRESS.replace("protocol: modbus", "protocol: profinet");
        assert!(parse_machine_file(Path::new("x.yml"), &text).is_err());
    }

    #[test]
    fn test_settings_list_and_null() {
        let dir = tempfile::tempdir().unwrap();
        let source = ConfigSource::new(dir.path());
        fs::write(dir.path().join(SETTINGS_FILE), "machines:\n  - a.yml\n").unwrap();
        assert_eq!(
            source.machine_files().unwrap(),
            vec![dir.path().join("a.yml")]
        );

        fs::write(
            dir.path().join(SETTINGS_FILE),
            "machines:\nmqtt:\n  host: 10.0.0.9\n  port: 1884\n",
        )
        .unwrap();
        assert!(source.machine_files().unwrap().is_empty());
        let mqtt = source.settings().unwrap().mqtt.unwrap();
        assert_eq!(mqtt.host.as_deref(), Some("10.0.0.9"));
        assert_eq!(mqtt.port, Some(1884));
    }

    #[test]
    fn test_scan_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("press.yml"), PRESS).unwrap();
        fs::write(dir.path().join(SETTINGS_FILE), "mqtt:\n  host: broker\n").unwrap();
        let source = ConfigSource::new(dir.path());
        assert_eq!(
            source.machine_files().unwrap(),
            vec![dir.path().join("press.yml")]
        );

        fs::create_dir(dir.path().join(MACHINES_DIR)).unwrap();
        assert!(source.machine_files().unwrap().is_empty());
    }

    #[test]
    fn test_bad_file_is_reported_and_others_load() {
        let dir = tempfile::tempdir().unwrap();
        let machines = dir.path().join(MACHINES_DIR);
        fs::create_dir(&machines).unwrap();
        fs::write(machines.join("good.yml"), PRESS).unwrap();
        fs::write(machines.join("bad.yml"), "machine: [unclosed").unwrap();

        let loaded = ConfigSource::new(dir.path()).load().unwrap();
        assert_eq!(loaded.definitions.len(), 1);
        assert_eq!(loaded.failures.len(), 1);
        assert!(!loaded.is_complete());
    }

    #[test]
    fn test_mtime_sees_machine_files_and_removals() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ConfigSource::new(dir.path().join("missing")).mtime().is_none());

        let machines = dir.path().join(MACHINES_DIR);
        fs::create_dir(&machines).unwrap();
        fs::write(machines.join("a.yml"), PRESS).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(machines.join("b.yml"), PRESS).unwrap();
        let source = ConfigSource::new(dir.path());
        let before = source.mtime().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::remove_file(machines.join("a.yml")).unwrap();
        assert!(source.mtime().unwrap() > before);
    }
}
