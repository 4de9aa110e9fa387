//! Host metrics collection behind a seam.
//!
//! The status reporter only sees the `MetricsSource` trait; production
//! wires in sysinfo, tests wire in a fixed sample.

use sysinfo::{Disks, System};

/// One host health sample.
#[derive(Debug, Clone, Default)]
pub struct HostMetrics {
    pub hostname: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub uptime_secs: i64,
}

pub trait MetricsSource: Send {
    fn collect(&mut self) -> HostMetrics;
}

/// sysinfo-backed metrics.
pub struct SystemMetrics {
    system: System,
    disks: Disks,
}

impl SystemMetrics {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SystemMetrics {
    fn collect(&mut self) -> HostMetrics {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh();

        let memory_percent = if self.system.total_memory() > 0 {
            self.system.used_memory() as f64 / self.system.total_memory() as f64 * 100.0
        } else {
            0.0
        };

        // Usage of the fullest mounted filesystem.
        let disk_percent = self
            .disks
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| {
                let used = d.total_space() - d.available_space();
                used as f64 / d.total_space() as f64 * 100.0
            })
            .fold(0.0_f64, f64::max);

        HostMetrics {
            hostname: System::host_name().unwrap_or_default(),
            cpu_percent: f64::from(self.system.global_cpu_usage()),
            memory_percent,
            disk_percent,
            uptime_secs: System::uptime() as i64,
        }
    }
}

/// Fixed sample for tests.
pub struct StaticMetrics(pub HostMetrics);

impl MetricsSource for StaticMetrics {
    fn collect(&mut self) -> HostMetrics {
        self.0.clone()
    }
}
