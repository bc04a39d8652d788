//! Container, host and process snapshots.
//!
//! Host-side sources that fail report zero values instead of an error.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sysinfo::{Networks, ProcessesToUpdate, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tracing::debug;

use crate::errors::AgentResult;
use crate::runtime_manager::ContainerDriver;

pub const DEFAULT_PROCESS_LIMIT: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub status: String,
    pub cpu: String,
    pub memory: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStats {
    pub hostname: String,
    pub uptime: u64,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub cpu: f64,
    pub mem_total: u64,
    pub mem_used: u64,
    pub mem_used_pct: f64,
    pub disk_total: u64,
    pub disk_used: u64,
    pub disk_used_pct: f64,
    pub net_rx: u64,
    pub net_tx: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cpu: f64,
    pub mem: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct DiskUsage {
    total: u64,
    used: u64,
    used_pct: f64,
}

/// Status must be readable; cpu and memory fall back to empty strings.
pub async fn container_stats(
    driver: &dyn ContainerDriver,
    container: &str,
) -> AgentResult<ContainerStats> {
    let status = driver.inspect_status(container).await?;
    let (cpu, memory) = driver.stats_snapshot(container).await;
    Ok(ContainerStats {
        status,
        cpu,
        memory,
    })
}

/// Host snapshot with disk usage measured on the filesystem holding `file_root`.
pub async fn host_stats(file_root: &str) -> AgentResult<HostStats> {
    let disk_path = if file_root.is_empty() {
        "/".to_string()
    } else {
        file_root.to_string()
    };

    let stats = tokio::task::spawn_blocking(move || collect_host(&disk_path)).await?;
    Ok(stats)
}

/// Up to `limit` processes ordered by pid; zero means the default limit.
pub async fn processes(limit: usize) -> AgentResult<Vec<ProcessInfo>> {
    let limit = if limit == 0 {
        DEFAULT_PROCESS_LIMIT
    } else {
        limit
    };
    let list = tokio::task::spawn_blocking(move || collect_processes(limit)).await?;
    Ok(list)
}

fn collect_host(disk_path: &str) -> HostStats {
    let mut system = System::new();
    system.refresh_cpu_usage();
    std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
    system.refresh_cpu_usage();
    system.refresh_memory();

    let load = System::load_average();
    let mem_total = system.total_memory();
    let mem_used = system.used_memory();

    let networks = Networks::new_with_refreshed_list();
    let (net_rx, net_tx) = networks
        .list()
        .iter()
        .fold((0u64, 0u64), |(rx, tx), (_, data)| {
            (
                rx.saturating_add(data.total_received()),
                tx.saturating_add(data.total_transmitted()),
            )
        });

    let disk = disk_usage(Path::new(disk_path));

    HostStats {
        hostname: System::host_name().unwrap_or_default(),
        uptime: System::uptime(),
        load1: load.one,
        load5: load.five,
        load15: load.fifteen,
        cpu: f64::from(system.global_cpu_usage()),
        mem_total,
        mem_used,
        mem_used_pct: percent(mem_used, mem_total),
        disk_total: disk.total,
        disk_used: disk.used,
        disk_used_pct: disk.used_pct,
        net_rx,
        net_tx,
    }
}

fn disk_usage(path: &Path) -> DiskUsage {
    match nix::sys::statvfs::statvfs(path) {
        Ok(vfs) => {
            let frsize = vfs.fragment_size() as u64;
            let total = (vfs.blocks() as u64).saturating_mul(frsize);
            let free = (vfs.blocks_free() as u64).saturating_mul(frsize);
            let avail = (vfs.blocks_available() as u64).saturating_mul(frsize);
            let used = total.saturating_sub(free);
            DiskUsage {
                total,
                used,
                used_pct: percent(used, used.saturating_add(avail)),
            }
        }
        Err(e) => {
            debug!("statvfs {:?} failed: {}", path, e);
            DiskUsage::default()
        }
    }
}

fn collect_processes(limit: usize) -> Vec<ProcessInfo> {
    let mut system = System::new();
    system.refresh_memory();
    system.refresh_processes(ProcessesToUpdate::All, true);
    std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mem_total = system.total_memory();
    let mut list: Vec<ProcessInfo> = system
        .processes()
        .iter()
        .map(|(pid, process)| ProcessInfo {
            pid: pid.as_u32(),
            name: process.name().to_string_lossy().to_string(),
            cpu: f64::from(process.cpu_usage()),
            mem: percent(process.memory(), mem_total) as f32,
        })
        .collect();
    list.sort_by_key(|p| p.pid);
    list.truncate(limit);
    list
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
