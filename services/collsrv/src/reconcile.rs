//! Apply machine definition files to the roster in the store

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{Device, DeviceId, Machine, MachineId, Sensor, SensorId};
use crate::source::{ConfigSource, MachineDefinition};
use crate::store::RosterStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub created: usize,
    pub updated: usize,
    pub disabled: usize,
    pub deleted: usize,
    pub skipped_files: Vec<PathBuf>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        self.created + self.updated + self.disabled + self.deleted > 0
    }
}

pub struct ConfigReconciler {
    store: Arc<dyn RosterStore>,
    source: ConfigSource,
    last_mtime: Option<SystemTime>,
}

impl ConfigReconciler {
    pub fn new(store: Arc<dyn RosterStore>, source: ConfigSource) -> Self {
        Self {
            store,
            source,
            last_mtime: None,
        }
    }

    pub fn source(&self) -> &ConfigSource {
        &self.source
    }

    /// Reconcile only when the definition tree changed since the last
    /// successful pass. A tree that vanished counts as a change.
    pub async fn reconcile_if_changed(&mut self) -> Result<Option<ReconcileReport>> {
        if let (Some(now), Some(last)) = (self.source.mtime(), self.last_mtime) {
            if now <= last {
                return Ok(None);
            }
        }
        self.reconcile().await.map(Some)
    }

    /// Apply the definitions unconditionally. The change marker only moves
    /// forward once the whole pass succeeds, so a failed pass is retried.
    pub async fn reconcile(&mut self) -> Result<ReconcileReport> {
        let mtime = self.source.mtime();
        let report = self.apply().await?;
        self.last_mtime = mtime;
        Ok(report)
    }

    async fn apply(&self) -> Result<ReconcileReport> {
        let loaded = self.source.load()?;

        let mut report = ReconcileReport {
            skipped_files: loaded.failures.iter().map(|(path, _)| path.clone()).collect(),
            ..Default::default()
        };

        let machines: HashMap<String, Machine> = self
            .store
            .machines()
            .await?
            .into_iter()
            .map(|m| (m.spec.code.clone(), m))
            .collect();
        let mut devices: HashMap<String, Device> = self
            .store
            .devices()
            .await?
            .into_iter()
            .map(|d| (d.spec.code.clone(), d))
            .collect();
        let mut sensors: HashMap<(DeviceId, String), Sensor> = self
            .store
            .sensors()
            .await?
            .into_iter()
            .map(|s| ((s.device_id, s.spec.code.clone()), s))
            .collect();

        let mut kept_machines = HashSet::new();
        let mut kept_sensors = HashSet::new();

        for def in &loaded.definitions {
            let machine_id = self
                .apply_machine(def, machines.get(&def.machine.code), &mut report)
                .await?;
            kept_machines.insert(machine_id);

            let existing = devices.remove(&def.device.code);
            let device_id = self
                .apply_device(def, machine_id, existing, &mut sensors, &mut report)
                .await?;

            for spec in &def.sensors {
                match sensors.get(&(device_id, spec.code.clone())) {
                    Some(sensor) => {
                        if sensor.spec != *spec {
                            self.store.update_sensor(sensor.id, spec).await?;
                            debug!("Updated sensor {}/{}", def.device.code, spec.code);
                            report.updated += 1;
                        }
                        kept_sensors.insert(sensor.id);
                    },
                    None => {
                        let id = self.store.insert_sensor(device_id, spec).await?;
                        debug!("Created sensor {}/{}", def.device.code, spec.code);
                        kept_sensors.insert(id);
                        report.created += 1;
                    },
                }
            }
        }

        if loaded.is_complete() {
            let removed_devices: Vec<Device> = devices.into_values().collect();
            self.purge(&removed_devices, &sensors, &kept_sensors, &kept_machines, &mut report)
                .await?;
        } else {
            warn!(
                "{} definition file(s) failed to load, skipping deletions this pass",
                report.skipped_files.len()
            );
        }

        if report.changed() || !report.skipped_files.is_empty() {
            info!(
                "Reconciled {} machine(s): created={} updated={} disabled={} deleted={} skipped={}",
                loaded.definitions.len(),
                report.created,
                report.updated,
                report.disabled,
                report.deleted,
                report.skipped_files.len()
            );
        } else {
            debug!("Roster unchanged ({} machines)", loaded.definitions.len());
        }
        Ok(report)
    }

    async fn apply_machine(
        &self,
        def: &MachineDefinition,
        existing: Option<&Machine>,
        report: &mut ReconcileReport,
    ) -> Result<MachineId> {
        match existing {
            Some(machine) => {
                if machine.spec != def.machine {
                    self.store.update_machine(machine.id, &def.machine).await?;
                    debug!("Updated machine {}", def.machine.code);
                    report.updated += 1;
                }
                Ok(machine.id)
            },
            None => {
                let id = self.store.insert_machine(&def.machine).await?;
                info!("Created machine {} ({})", def.machine.code, def.machine.name);
                report.created += 1;
                Ok(id)
            },
        }
    }

    async fn apply_device(
        &self,
        def: &MachineDefinition,
        machine_id: MachineId,
        existing: Option<Device>,
        sensors: &mut HashMap<(DeviceId, String), Sensor>,
        report: &mut ReconcileReport,
    ) -> Result<DeviceId> {
        let mut wanted = def.device.clone();

        if let Some(device) = existing {
            if device.machine_id == machine_id {
                wanted.enabled = def.enabled.unwrap_or(device.spec.enabled);
                if device.spec != wanted {
                    self.store.update_device(device.id, &wanted).await?;
                    info!("Updated PLC {} ({})", wanted.code, device.endpoint());
                    report.updated += 1;
                }
                return Ok(device.id);
            }

            // Moved to another machine: rebuild under the new owner
            self.store.set_device_enabled(device.id, false).await?;
            let owned: Vec<(DeviceId, String)> = sensors
                .keys()
                .filter(|(device_id, _)| *device_id == device.id)
                .cloned()
                .collect();
            for key in owned {
                if let Some(sensor) = sensors.remove(&key) {
                    self.store.delete_sensor(sensor.id).await?;
                    report.deleted += 1;
                }
            }
            self.store.delete_device(device.id).await?;
            report.deleted += 1;
            info!("PLC {} moved to machine {}", wanted.code, def.machine.code);
        }

        wanted.enabled = def.enabled.unwrap_or(true);
        let id = self.store.insert_device(machine_id, &wanted).await?;
        info!(
            "Created PLC {} at {}:{} (unit {})",
            wanted.code, wanted.host, wanted.port, wanted.unit_id
        );
        report.created += 1;
        Ok(id)
    }

    /// Disable, then drop sensors, then devices, then orphaned machines
    async fn purge(
        &self,
        removed_devices: &[Device],
        sensors: &HashMap<(DeviceId, String), Sensor>,
        kept_sensors: &HashSet<SensorId>,
        kept_machines: &HashSet<MachineId>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        for device in removed_devices {
            if device.spec.enabled {
                self.store.set_device_enabled(device.id, false).await?;
                info!("Disabled PLC {} (no longer configured)", device.spec.code);
                report.disabled += 1;
            }
        }

        for sensor in sensors.values() {
            if !kept_sensors.contains(&sensor.id) {
                self.store.delete_sensor(sensor.id).await?;
                info!("Deleted sensor {} of device {}", sensor.spec.code, sensor.device_id);
                report.deleted += 1;
            }
        }

        for device in removed_devices {
            self.store.delete_device(device.id).await?;
            info!("Deleted PLC {}", device.spec.code);
            report.deleted += 1;
        }

        let remaining: Vec<Device> = self.store.devices().await?;
        for machine in self.store.machines().await? {
            let owns_devices = remaining.iter().any(|d| d.machine_id == machine.id);
            if !owns_devices && !kept_machines.contains(&machine.id) {
                self.store.delete_machine(machine.id).await?;
                info!("Deleted machine {}", machine.spec.code);
                report.deleted += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use std::fs;
    use std::path::Path;
    use tracing_test::traced_test;

    const MACHINE: &str = r#"
machine:
  code: sec21
  name: Press 21
plc:
  code: plc1
  name: Press PLC
  protocol: modbus
  ip_address: 127.0.0.1
  port: 1502
sensors:
  - code: temp
    name: Temperature
    address: 10
  - code: pressure
    name: Pressure
    address: 11
"#;

    async fn fixture() -> (tempfile::TempDir, Arc<SqliteStore>, ConfigReconciler) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("config");
        fs::create_dir_all(root.join("machines")).unwrap();
        fs::write(root.join("machines/sec21.yml"), MACHINE).unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("c.db")).await.unwrap());
        let reconciler = ConfigReconciler::new(store.clone(), ConfigSource::new(root));
        (dir, store, reconciler)
    }

    fn write(root: &Path, name: &str, text: &str) {
        fs::write(root.join("machines").join(name), text).unwrap();
    }

    #[tokio::test]
    async fn test_first_pass_creates_everything() {
        let (_dir, store, mut reconciler) = fixture().await;
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.created, 4);
        assert_eq!(store.enabled_assignments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_removed_sensor_is_deleted() {
        let (_dir, store, mut reconciler) = fixture().await;
        reconciler.reconcile().await.unwrap();
        let root = reconciler.source().root().to_path_buf();
        let trimmed = MACHINE.split("  - code: pressure").next().unwrap().to_string();
        write(&root, "sec21.yml", &trimmed);

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(store.sensors().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_enabled_false_disables() {
        let (_dir, store, mut reconciler) = fixture().await;
        reconciler.reconcile().await.unwrap();
        let root = reconciler.source().root().to_path_buf();
        write(&root, "sec21.yml", &MACHINE.replace("  port: 1502", "  port: 1502\n  enabled: false"));

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.updated, 1);
        assert!(store.enabled_assignments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_removed_machine_is_staged_out() {
        let (_dir, store, mut reconciler) = fixture().await;
        reconciler.reconcile().await.unwrap();
        let root = reconciler.source().root().to_path_buf();
        fs::remove_file(root.join("machines/sec21.yml")).unwrap();

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.disabled, 1);
        // two sensors, one device, one machine
        assert_eq!(report.deleted, 4);
        assert!(store.machines().await.unwrap().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_broken_file_blocks_deletions() {
        let (_dir, store, mut reconciler) = fixture().await;
        reconciler.reconcile().await.unwrap();
        let root = reconciler.source().root().to_path_buf();
        write(&root, "sec21.yml", "machine: [");

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.skipped_files.len(), 1);
        assert_eq!(report.deleted, 0);
        assert_eq!(store.sensors().await.unwrap().len(), 2);
        assert!(logs_contain("skipping deletions"));
    }
}
