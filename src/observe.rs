//! Host observation: filesystem and memory usage, and resource hogs.
//!
//! [`SystemObserver`] reads everything through `sysinfo`. Collection is
//! blocking (process CPU usage needs two samples some time apart), so it
//! runs on tokio's blocking pool.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use sysinfo::{Disks, System};

use crate::models::{DiskUsage, ObservationContext, ResourceHog};

/// Delay between the two process samples used to compute CPU usage.
const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(500);

#[async_trait]
pub trait Observer: Send + Sync {
    /// Current disk and memory usage.
    async fn observe(&self) -> Result<ObservationContext>;

    /// Processes above either threshold, heaviest first.
    async fn resource_hogs(&self, cpu_threshold: f32, memory_threshold: f32)
        -> Result<Vec<ResourceHog>>;
}

/// One process reading, before threshold filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Filter `samples` down to hogs, heaviest (cpu + memory) first.
///
/// A process qualifies when it is strictly above either threshold. `exclude`
/// is skipped so the agent never remediates itself.
pub fn find_hogs(
    samples: impl IntoIterator<Item = ProcessSample>,
    cpu_threshold: f32,
    memory_threshold: f32,
    exclude: Option<u32>,
) -> Vec<ResourceHog> {
    let mut hogs: Vec<ResourceHog> = samples
        .into_iter()
        .filter(|s| Some(s.pid) != exclude)
        .filter_map(|s| {
            let mut reasons = Vec::new();
            if s.cpu_percent > cpu_threshold {
                reasons.push(format!("CPU: {:.1}%", s.cpu_percent));
            }
            if s.memory_percent > memory_threshold {
                reasons.push(format!("Memory: {:.1}%", s.memory_percent));
            }
            if reasons.is_empty() {
                return None;
            }
            Some(ResourceHog {
                pid: s.pid,
                name: s.name,
                cpu_percent: s.cpu_percent,
                memory_percent: s.memory_percent,
                reasons,
            })
        })
        .collect();

    hogs.sort_by(|a, b| {
        let wa = a.cpu_percent + a.memory_percent;
        let wb = b.cpu_percent + b.memory_percent;
        wb.total_cmp(&wa).then_with(|| a.pid.cmp(&b.pid))
    });
    hogs
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

/// [`Observer`] backed by `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemObserver;

impl SystemObserver {
    pub fn new() -> Self {
        Self
    }

    fn collect_context() -> ObservationContext {
        let disks = Disks::new_with_refreshed_list();
        let mut disk_usage: Vec<DiskUsage> = disks
            .list()
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| DiskUsage {
                filesystem: d.mount_point().display().to_string(),
                usage_percent: percent(
                    d.total_space().saturating_sub(d.available_space()),
                    d.total_space(),
                ),
            })
            .collect();
        // Bind mounts and snaps can repeat a mount point.
        disk_usage.dedup_by(|a, b| a.filesystem == b.filesystem);

        let mut sys = System::new();
        sys.refresh_memory();
        let memory_usage = match sys.total_memory() {
            0 => None,
            total => Some(percent(sys.used_memory(), total)),
        };

        ObservationContext {
            disk_usage,
            memory_usage,
        }
    }

    fn collect_samples() -> Vec<ProcessSample> {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_processes();
        std::thread::sleep(CPU_SAMPLE_WINDOW.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL));
        sys.refresh_processes();

        let total = sys.total_memory();
        sys.processes()
            .values()
            .map(|p| ProcessSample {
                pid: p.pid().as_u32(),
                name: p.name().to_string(),
                cpu_percent: p.cpu_usage(),
                memory_percent: percent(p.memory(), total) as f32,
            })
            .collect()
    }
}

#[async_trait]
impl Observer for SystemObserver {
    async fn observe(&self) -> Result<ObservationContext> {
        let ctx = tokio::task::spawn_blocking(Self::collect_context).await?;
        tracing::debug!(
            "observed {} filesystems, memory {:?}%",
            ctx.disk_usage.len(),
            ctx.memory_usage
        );
        Ok(ctx)
    }

    async fn resource_hogs(
        &self,
        cpu_threshold: f32,
        memory_threshold: f32,
    ) -> Result<Vec<ResourceHog>> {
        let samples = tokio::task::spawn_blocking(Self::collect_samples).await?;
        let own_pid = std::process::id();
        Ok(find_hogs(samples, cpu_threshold, memory_threshold, Some(own_pid)))
    }
}
