//! Host resource sampling
//!
//! Provides CPU, memory, disk, network and process usage using the sysinfo crate.

use serde::Serialize;
use sysinfo::{Disks, Networks, Pid, System};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuUsage {
    pub percent: f32,
    pub count: usize,
    pub freq_mhz: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryUsage {
    pub total_gb: f64,
    pub available_gb: f64,
    pub used_gb: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskUsage {
    pub mount_point: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkUsage {
    pub bytes_sent_mb: f64,
    pub bytes_recv_mb: f64,
    pub packets_sent: u64,
    pub packets_recv: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessUsage {
    pub memory_mb: f64,
    /// Can exceed 100% on multi-core hosts
    pub cpu_percent: f32,
}

/// One host resource snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SystemResources {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub cpu: CpuUsage,
    pub memory: MemoryUsage,
    pub disk: Option<DiskUsage>,
    pub network: NetworkUsage,
    pub process: ProcessUsage,
}

/// Long-lived sampler.
///
/// CPU percentages are computed between two refreshes, so the sampler keeps
/// its `System` across calls; the first sample after construction reports 0%.
pub struct ResourceSampler {
    sys: System,
    networks: Networks,
    pid: Pid,
}

impl ResourceSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        Self {
            sys,
            networks: Networks::new_with_refreshed_list(),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    pub fn sample(&mut self) -> SystemResources {
        self.sys.refresh_memory();
        self.sys.refresh_cpu_usage();
        self.sys.refresh_cpu_frequency();
        self.sys.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[self.pid]),
            true,
            sysinfo::ProcessRefreshKind::new().with_cpu().with_memory(),
        );
        self.networks.refresh();

        let cpus = self.sys.cpus();
        let cpu = CpuUsage {
            percent: self.sys.global_cpu_usage(),
            count: cpus.len(),
            freq_mhz: cpus.first().map(|c| c.frequency()).filter(|f| *f > 0),
        };

        let total = self.sys.total_memory() as f64;
        let available = self.sys.available_memory() as f64;
        let used = self.sys.used_memory() as f64;
        let memory = MemoryUsage {
            total_gb: round2(total / BYTES_PER_GB),
            available_gb: round2(available / BYTES_PER_GB),
            used_gb: round2(used / BYTES_PER_GB),
            percent: if total > 0.0 {
                round2(used / total * 100.0)
            } else {
                0.0
            },
        };

        let (sent, recv, packets_sent, packets_recv) = self.networks.iter().fold(
            (0u64, 0u64, 0u64, 0u64),
            |(s, r, ps, pr), (_, data)| {
                (
                    s + data.total_transmitted(),
                    r + data.total_received(),
                    ps + data.total_packets_transmitted(),
                    pr + data.total_packets_received(),
                )
            },
        );
        let network = NetworkUsage {
            bytes_sent_mb: round2(sent as f64 / BYTES_PER_MB),
            bytes_recv_mb: round2(recv as f64 / BYTES_PER_MB),
            packets_sent,
            packets_recv,
        };

        let process = self
            .sys
            .process(self.pid)
            .map(|p| ProcessUsage {
                memory_mb: round2(p.memory() as f64 / BYTES_PER_MB),
                cpu_percent: p.cpu_usage(),
            })
            .unwrap_or(ProcessUsage {
                memory_mb: 0.0,
                cpu_percent: 0.0,
            });

        SystemResources {
            timestamp: chrono::Utc::now(),
            cpu,
            memory,
            disk: root_disk_usage(),
            network,
            process,
        }
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Usage of the root mount, or the largest disk when there is no `/`
fn root_disk_usage() -> Option<DiskUsage> {
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
        .or_else(|| disks.iter().max_by_key(|d| d.total_space()))?;

    let total = disk.total_space() as f64;
    let free = disk.available_space() as f64;
    let used = (total - free).max(0.0);
    Some(DiskUsage {
        mount_point: disk.mount_point().display().to_string(),
        total_gb: round2(total / BYTES_PER_GB),
        used_gb: round2(used / BYTES_PER_GB),
        free_gb: round2(free / BYTES_PER_GB),
        percent: if total > 0.0 {
            round2(used / total * 100.0)
        } else {
            0.0
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_reports_host_shape() {
        let mut sampler = ResourceSampler::new();
        let snapshot = sampler.sample();
        assert!(snapshot.cpu.count > 0);
        assert!(snapshot.memory.total_gb > 0.0);
        assert!(snapshot.memory.percent >= 0.0 && snapshot.memory.percent <= 100.0);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(1.23456), 1.23);
        assert_eq!(round2(0.005), 0.01);
    }
}
