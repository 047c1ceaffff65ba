//! Group scheduler: exactly one reader task per endpoint in the enabled roster

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::model::{DeviceAssignment, DeviceId, Endpoint};
use crate::reader::{DeviceReader, ReaderContext};

/// Sorted `(device id, poll interval seconds)` of one endpoint group
pub type GroupSignature = Vec<(DeviceId, u64)>;

pub fn group_by_endpoint(roster: &[DeviceAssignment]) -> BTreeMap<Endpoint, Vec<DeviceAssignment>> {
    let mut groups: BTreeMap<Endpoint, Vec<DeviceAssignment>> = BTreeMap::new();
    for assignment in roster {
        groups
            .entry(assignment.device.endpoint())
            .or_default()
            .push(assignment.clone());
    }
    for members in groups.values_mut() {
        members.sort_by_key(|a| a.device.id);
    }
    groups
}

pub fn signature(members: &[DeviceAssignment]) -> GroupSignature {
    let mut signature: GroupSignature = members
        .iter()
        .map(|a| (a.device.id, a.device.poll_interval().as_secs()))
        .collect();
    signature.sort_unstable();
    signature
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerReport {
    pub started: Vec<Endpoint>,
    pub stopped: Vec<Endpoint>,
    pub restarted: Vec<Endpoint>,
    pub unchanged: Vec<Endpoint>,
}

impl SchedulerReport {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.restarted.is_empty()
    }
}

struct RunningGroup {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    signature: GroupSignature,
}

pub struct GroupScheduler {
    ctx: ReaderContext,
    parent: CancellationToken,
    running: HashMap<Endpoint, RunningGroup>,
}

impl GroupScheduler {
    pub fn new(ctx: ReaderContext, parent: CancellationToken) -> Self {
        Self {
            ctx,
            parent,
            running: HashMap::new(),
        }
    }

    pub fn running_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self.running.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    pub fn signature_of(&self, endpoint: &Endpoint) -> Option<&GroupSignature> {
        self.running.get(endpoint).map(|group| &group.signature)
    }

    /// Bring running readers in line with `roster`
    pub async fn sync(&mut self, roster: &[DeviceAssignment]) -> SchedulerReport {
        let groups = group_by_endpoint(roster);
        let mut report = SchedulerReport::default();

        let gone: Vec<Endpoint> = self
            .running
            .keys()
            .filter(|endpoint| !groups.contains_key(*endpoint))
            .cloned()
            .collect();
        for endpoint in gone {
            self.stop(&endpoint).await;
            self.ctx.links.remove(&endpoint);
            info!("Reader for {} stopped: no enabled devices left", endpoint);
            report.stopped.push(endpoint);
        }

        for (endpoint, members) in groups {
            let wanted = signature(&members);
            let current = self
                .running
                .get(&endpoint)
                .map(|group| (group.signature.clone(), group.handle.is_finished()));
            match current {
                None => {
                    info!("Reader for {} starting: {:?}", endpoint, wanted);
                    self.start(endpoint.clone(), members, wanted);
                    report.started.push(endpoint);
                },
                Some((running, false)) if running == wanted => {
                    report.unchanged.push(endpoint);
                },
                Some((running, finished)) => {
                    if finished {
                        warn!("Reader for {} exited unexpectedly, restarting", endpoint);
                    } else {
                        info!(
                            "Reader for {} restarting: {:?} -> {:?}",
                            endpoint, running, wanted
                        );
                    }
                    self.stop(&endpoint).await;
                    self.start(endpoint.clone(), members, wanted);
                    report.restarted.push(endpoint);
                },
            }
        }

        report
    }

    /// Cancel and await every reader
    pub async fn shutdown(&mut self) {
        let endpoints: Vec<Endpoint> = self.running.keys().cloned().collect();
        for endpoint in endpoints {
            self.stop(&endpoint).await;
        }
        info!("All readers stopped");
    }

    fn start(&mut self, endpoint: Endpoint, members: Vec<DeviceAssignment>, signature: GroupSignature) {
        let cancel = self.parent.child_token();
        let reader = DeviceReader::new(endpoint.clone(), members, self.ctx.clone());
        let handle = tokio::spawn(reader.run(cancel.clone()));
        self.running.insert(
            endpoint,
            RunningGroup {
                handle,
                cancel,
                signature,
            },
        );
    }

    /// The old reader is fully terminated before this returns
    async fn stop(&mut self, endpoint: &Endpoint) {
        if let Some(group) = self.running.remove(endpoint) {
            group.cancel.cancel();
            if let Err(e) = group.handle.await {
                warn!("Reader for {} ended abnormally: {}", endpoint, e);
            }
        }
    }
}
