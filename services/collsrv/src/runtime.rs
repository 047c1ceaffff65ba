//! Supervision loop: reconcile definitions, then align readers with the roster

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::reconcile::{ConfigReconciler, ReconcileReport};
use crate::scheduler::{GroupScheduler, SchedulerReport};
use crate::store::RosterStore;

pub struct Supervisor {
    reconciler: ConfigReconciler,
    scheduler: GroupScheduler,
    roster: Arc<dyn RosterStore>,
    tick: Duration,
}

impl Supervisor {
    pub fn new(
        reconciler: ConfigReconciler,
        scheduler: GroupScheduler,
        roster: Arc<dyn RosterStore>,
        tick: Duration,
    ) -> Self {
        Self {
            reconciler,
            scheduler,
            roster,
            tick,
        }
    }

    pub fn scheduler(&self) -> &GroupScheduler {
        &self.scheduler
    }

    /// Unconditional reconcile and sync, used once at startup
    pub async fn start(&mut self) -> Option<SchedulerReport> {
        match self.reconciler.reconcile().await {
            Ok(report) => log_report(&report),
            Err(e) => error!("Initial reconciliation failed: {}", e),
        }
        self.sync().await
    }

    /// One tick: reconcile if a definition changed, then sync readers
    pub async fn tick(&mut self) -> Option<SchedulerReport> {
        match self.reconciler.reconcile_if_changed().await {
            Ok(Some(report)) => {
                info!("Definition change detected");
                log_report(&report);
            },
            Ok(None) => {},
            Err(e) => warn!("Reconciliation failed: {}", e),
        }
        self.sync().await
    }

    async fn sync(&mut self) -> Option<SchedulerReport> {
        let roster = match self.roster.enabled_assignments().await {
            Ok(roster) => roster,
            Err(e) => {
                warn!("Could not load enabled roster, readers left as they are: {}", e);
                return None;
            },
        };
        let report = self.scheduler.sync(&roster).await;
        if report.is_noop() {
            debug!("{} reader(s) unchanged", report.unchanged.len());
        } else {
            info!(
                "Readers: started={} restarted={} stopped={} unchanged={}",
                report.started.len(),
                report.restarted.len(),
                report.stopped.len(),
                report.unchanged.len()
            );
        }
        Some(report)
    }

    /// Tick until cancelled, then stop every reader
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Supervisor running (tick {:?})", self.tick);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.tick) => {
                    self.tick().await;
                },
            }
        }
        self.scheduler.shutdown().await;
        info!("Supervisor stopped");
    }
}

fn log_report(report: &ReconcileReport) {
    for file in &report.skipped_files {
        warn!("Definition file skipped: {}", file.display());
    }
}
