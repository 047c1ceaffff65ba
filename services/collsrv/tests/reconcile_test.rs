//! Definition reconciliation and the supervision loop end to end

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use collsrv::metrics::WriteStats;
use collsrv::model::Endpoint;
use collsrv::publish::realtime::RealtimeHub;
use collsrv::publish::Publisher;
use collsrv::reader::{LinkRegistry, ReaderContext, ReaderSettings};
use collsrv::reconcile::ConfigReconciler;
use collsrv::runtime::Supervisor;
use collsrv::scheduler::GroupScheduler;
use collsrv::source::ConfigSource;
use collsrv::store::{RosterStore, SqliteStore};
use common::{machine_yaml, FlakyRoster, MockModbusServer};
use tokio_util::sync::CancellationToken;

fn write_machine(root: &Path, name: &str, text: &str) {
    fs::create_dir_all(root.join("machines")).unwrap();
    fs::write(root.join("machines").join(name), text).unwrap();
}

#[tokio::test]
async fn test_second_pass_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("config");
    write_machine(&root, "a.yml", &machine_yaml("sec21", "plc1", 1502, 1, &[("temp", 1), ("rpm", 2)]));
    write_machine(&root, "b.yml", &machine_yaml("sec22", "plc2", 1503, 2, &[("temp", 1)]));

    let store = Arc::new(SqliteStore::open(dir.path().join("c.db")).await.unwrap());
    let mut reconciler = ConfigReconciler::new(store.clone(), ConfigSource::new(&root));

    let first = reconciler.reconcile().await.unwrap();
    assert_eq!(first.created, 7);

    let second = reconciler.reconcile().await.unwrap();
    assert!(!second.changed());
    assert_eq!(store.sensors().await.unwrap().len(), 3);

    assert!(reconciler.reconcile_if_changed().await.unwrap().is_none());
}

#[tokio::test]
async fn test_sensor_edit_is_an_update() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("config");
    write_machine(&root, "a.yml", &machine_yaml("sec21", "plc1", 1502, 1, &[("temp", 1)]));

    let store = Arc::new(SqliteStore::open(dir.path().join("c.db")).await.unwrap());
    let mut reconciler = ConfigReconciler::new(store.clone(), ConfigSource::new(&root));
    reconciler.reconcile().await.unwrap();
    let before = store.sensors().await.unwrap();

    write_machine(&root, "a.yml", &machine_yaml("sec21", "plc1", 1502, 1, &[("temp", 40)]));
    let report = reconciler.reconcile().await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.created, 0);

    let after = store.sensors().await.unwrap();
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(after[0].spec.address, 40);
}

#[tokio::test]
async fn test_failed_pass_is_retried_without_edits() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("config");
    write_machine(&root, "a.yml", &machine_yaml("sec21", "plc1", 1502, 1, &[("temp", 1)]));

    let store = Arc::new(SqliteStore::open(dir.path().join("c.db")).await.unwrap());
    let roster = Arc::new(FlakyRoster::new(store.clone()));
    let mut reconciler = ConfigReconciler::new(roster.clone(), ConfigSource::new(&root));

    roster.set_failing(true);
    let err = reconciler.reconcile_if_changed().await.unwrap_err();
    assert!(err.to_string().contains("database is locked"));
    assert!(store.sensors().await.unwrap().is_empty());

    // same files, healthy store: the half-applied pass completes
    roster.set_failing(false);
    let report = reconciler.reconcile_if_changed().await.unwrap().unwrap();
    assert_eq!(report.created, 1);
    assert_eq!(store.sensors().await.unwrap().len(), 1);

    assert!(reconciler.reconcile_if_changed().await.unwrap().is_none());
}

#[tokio::test]
async fn test_deleted_files_are_detected() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("config");
    write_machine(&root, "a.yml", &machine_yaml("sec21", "plc1", 1502, 1, &[("temp", 1)]));
    tokio::time::sleep(Duration::from_millis(20)).await;
    write_machine(&root, "b.yml", &machine_yaml("sec22", "plc2", 1503, 1, &[("temp", 1)]));

    let store = Arc::new(SqliteStore::open(dir.path().join("c.db")).await.unwrap());
    let mut reconciler = ConfigReconciler::new(store.clone(), ConfigSource::new(&root));
    reconciler.reconcile_if_changed().await.unwrap().unwrap();
    assert_eq!(store.enabled_assignments().await.unwrap().len(), 2);

    // the older file goes away; the newest remaining file is unchanged
    tokio::time::sleep(Duration::from_millis(20)).await;
    fs::remove_file(root.join("machines/a.yml")).unwrap();
    let report = reconciler.reconcile_if_changed().await.unwrap().unwrap();
    assert_eq!(report.disabled, 1);
    // sensor, device, machine
    assert_eq!(report.deleted, 3);
    assert_eq!(store.enabled_assignments().await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    fs::remove_file(root.join("machines/b.yml")).unwrap();
    let report = reconciler.reconcile_if_changed().await.unwrap().unwrap();
    assert_eq!(report.disabled, 1);
    assert!(store.enabled_assignments().await.unwrap().is_empty());
    assert!(store.machines().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_supervisor_follows_definition_changes() {
    let server = MockModbusServer::start().await;
    server.set_register(1, 42);

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("config");
    let yaml = machine_yaml("sec21", "plc1", server.port(), 1, &[("temp", 1)]);
    write_machine(&root, "a.yml", &yaml);

    let store = Arc::new(SqliteStore::open(dir.path().join("c.db")).await.unwrap());
    let ctx = ReaderContext {
        store: store.clone(),
        publisher: Publisher::new(None, Arc::new(RealtimeHub::new())),
        stats: Arc::new(WriteStats::new()),
        links: Arc::new(LinkRegistry::new()),
        settings: ReaderSettings::default(),
    };
    let mut supervisor = Supervisor::new(
        ConfigReconciler::new(store.clone(), ConfigSource::new(&root)),
        GroupScheduler::new(ctx, CancellationToken::new()),
        store.clone(),
        Duration::from_secs(60),
    );

    let report = supervisor.start().await.unwrap();
    assert_eq!(report.started, vec![Endpoint::new("127.0.0.1", server.port())]);

    let sensor = store.sensors().await.unwrap()[0].id;
    let mut stored = None;
    for _ in 0..50 {
        stored = store.last_value(sensor).await.unwrap();
        if stored.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(stored.map(|v| v.value), Some(42.0));

    // unchanged definitions: nothing to do
    let report = supervisor.tick().await.unwrap();
    assert!(report.is_noop());

    tokio::time::sleep(Duration::from_millis(20)).await;
    write_machine(
        &root,
        "a.yml",
        &yaml.replace("  poll_interval_s: 1\n", "  poll_interval_s: 1\n  enabled: false\n"),
    );
    let report = supervisor.tick().await.unwrap();
    assert_eq!(report.stopped.len(), 1);
    assert!(supervisor.scheduler().running_endpoints().is_empty());
    assert!(store.enabled_assignments().await.unwrap().is_empty());
}
