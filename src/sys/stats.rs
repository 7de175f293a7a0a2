// Host statistics for the dashboard.

use async_trait::async_trait;
use std::path::Path;
use sysinfo::{Disks, System};

use crate::sys::traits::{HostStats, StatsProvider};

pub fn percent(used: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        ((used as f64 / total as f64) * 100.0) as f32
    }
}

pub struct SysinfoStats;

impl SysinfoStats {
    fn sample() -> HostStats {
        let mut sys = System::new();

        // CPU usage is a delta between two refreshes.
        sys.refresh_cpu_usage();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .list()
            .iter()
            .find(|d| d.mount_point() == Path::new("/"))
            .or_else(|| disks.list().iter().max_by_key(|d| d.total_space()));
        let (disk_total, disk_available) = root
            .map(|d| (d.total_space(), d.available_space()))
            .unwrap_or((0, 0));

        let load = System::load_average();
        let memory_total = sys.total_memory();
        let memory_used = sys.used_memory();

        HostStats {
            hostname: System::host_name().unwrap_or_else(|| "localhost".to_string()),
            cpu_percent: sys.global_cpu_usage(),
            memory_total_bytes: memory_total,
            memory_used_bytes: memory_used,
            memory_percent: percent(memory_used, memory_total),
            disk_total_bytes: disk_total,
            disk_available_bytes: disk_available,
            disk_percent: percent(disk_total.saturating_sub(disk_available), disk_total),
            uptime_secs: System::uptime(),
            load_average: [load.one, load.five, load.fifteen],
        }
    }
}

#[async_trait]
impl StatsProvider for SysinfoStats {
    async fn collect(&self) -> Result<HostStats, String> {
        // The CPU sample sleeps; keep it off the async workers.
        tokio::task::spawn_blocking(Self::sample)
            .await
            .map_err(|e| format!("Stats sampler failed: {}", e))
    }
}
