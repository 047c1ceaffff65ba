//! Collector statistics and the periodic status publisher

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::ResourceSampler;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::publish::{
    iso_timestamp, Publisher, TOPIC_COLLECTOR, TOPIC_DATABASE, TOPIC_RESOURCES, TOPIC_STATUS,
};
use crate::reader::LinkRegistry;
use crate::store::StoreIntrospection;

#[derive(Debug, Default)]
struct Counters {
    records_saved: u64,
    records_failed: u64,
    write_operations: u64,
    total_write_ms: f64,
    last_write_ms: f64,
    read_errors: u64,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
}

/// Snapshot published on `system/collector`
#[derive(Debug, Clone, Serialize)]
pub struct CollectorStats {
    pub records_saved: u64,
    pub records_failed: u64,
    pub write_operations: u64,
    pub avg_write_ms: f64,
    pub last_write_ms: f64,
    pub read_errors: u64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
}

/// Process-wide persistence counters
pub struct WriteStats {
    counters: Mutex<Counters>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl Default for WriteStats {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteStats {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn record_write(&self, elapsed: Duration, records: usize) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let mut c = self.counters.lock();
        c.records_saved += records as u64;
        c.write_operations += 1;
        c.total_write_ms += ms;
        c.last_write_ms = ms;
    }

    pub fn record_failure(&self, records: usize, error: &str) {
        let mut c = self.counters.lock();
        c.records_failed += records as u64;
        c.last_error = Some(error.to_string());
        c.last_error_at = Some(Utc::now());
    }

    pub fn record_read_error(&self) {
        self.counters.lock().read_errors += 1;
    }

    pub fn snapshot(&self) -> CollectorStats {
        let c = self.counters.lock();
        let avg = if c.write_operations > 0 {
            c.total_write_ms / c.write_operations as f64
        } else {
            0.0
        };
        CollectorStats {
            records_saved: c.records_saved,
            records_failed: c.records_failed,
            write_operations: c.write_operations,
            avg_write_ms: round2(avg),
            last_write_ms: round2(c.last_write_ms),
            read_errors: c.read_errors,
            last_error: c.last_error.clone(),
            last_error_at: c.last_error_at,
            started_at: self.started_at,
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Publishes the retained `system/*` snapshots on a fixed interval
pub struct StatusReporter {
    stats: Arc<WriteStats>,
    store: Arc<dyn StoreIntrospection>,
    links: Arc<LinkRegistry>,
    publisher: Publisher,
    interval: Duration,
    sampler: ResourceSampler,
}

impl StatusReporter {
    pub fn new(
        stats: Arc<WriteStats>,
        store: Arc<dyn StoreIntrospection>,
        links: Arc<LinkRegistry>,
        publisher: Publisher,
        interval: Duration,
    ) -> Self {
        Self {
            stats,
            store,
            links,
            publisher,
            interval,
            sampler: ResourceSampler::new(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Status reporter started (every {:?})", self.interval);
        loop {
            self.publish_once().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {},
            }
        }
        debug!("Status reporter stopped");
    }

    /// Publish every snapshot topic once
    pub async fn publish_once(&mut self) {
        let collector = self.stats.snapshot();
        let database = match self.store.introspect().await {
            Ok(stats) => json!(stats),
            Err(e) => {
                warn!("Store introspection failed: {}", e);
                json!({ "status": "error", "error": e.to_string() })
            },
        };
        let resources = json!(self.sampler.sample());
        let bus = self.publisher.bus_status();

        self.publisher.system(TOPIC_COLLECTOR, &json!(collector));
        self.publisher.system(TOPIC_DATABASE, &database);
        self.publisher.system(TOPIC_RESOURCES, &resources);
        self.publisher.system(
            TOPIC_STATUS,
            &json!({
                "timestamp": iso_timestamp(Utc::now()),
                "service": "collsrv",
                "collector": collector,
                "database": database,
                "resources": resources,
                "endpoints": self.links.snapshot(),
                "bus": bus,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_average() {
        let stats = WriteStats::new();
        stats.record_write(Duration::from_millis(10), 4);
        stats.record_write(Duration::from_millis(30), 2);
        stats.record_failure(3, "database is locked");
        stats.record_read_error();

        let snap = stats.snapshot();
        assert_eq!(snap.records_saved, 6);
        assert_eq!(snap.records_failed, 3);
        assert_eq!(snap.write_operations, 2);
        assert!((snap.avg_write_ms - 20.0).abs() < 0.5);
        assert!((snap.last_write_ms - 30.0).abs() < 0.5);
        assert_eq!(snap.read_errors, 1);
        assert_eq!(snap.last_error.as_deref(), Some("database is locked"));
    }
}
