//! Host resource sampling backed by `sysinfo`.
//!
//! CPU usage is a delta between two refreshes, so the very first sample
//! after construction reads close to zero.  Disk-write throughput is the sum
//! of bytes every process wrote since the previous sample divided by the
//! elapsed time.

use std::time::Instant;

use sysinfo::System;
use tracing::debug;

use crate::application::adaptive_load::{HostMetrics, MetricsError, MetricsSource};

const BYTES_PER_MB: f64 = 1_000_000.0;

pub struct SysinfoMetrics {
    system: System,
    last_sample: Option<Instant>,
}

impl SysinfoMetrics {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_processes();
        Self {
            system,
            last_sample: Some(Instant::now()),
        }
    }
}

impl Default for SysinfoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoMetrics {
    fn sample(&mut self) -> Result<HostMetrics, MetricsError> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.system.refresh_processes();

        let total = self.system.total_memory();
        if total == 0 {
            return Err(MetricsError::Unavailable("total memory reported as zero".to_string()));
        }
        let used = total.saturating_sub(self.system.available_memory());
        let memory_percent = used as f64 / total as f64 * 100.0;

        let now = Instant::now();
        let written: u64 = self
            .system
            .processes()
            .values()
            .map(|p| p.disk_usage().written_bytes)
            .sum();
        let disk_write_mbps = match self.last_sample.replace(now) {
            Some(prev) => {
                let secs = now.duration_since(prev).as_secs_f64();
                if secs > 0.0 {
                    written as f64 / BYTES_PER_MB / secs
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        let metrics = HostMetrics {
            cpu_percent: f64::from(self.system.global_cpu_info().cpu_usage()),
            memory_percent,
            disk_write_mbps,
        };
        debug!(
            "host metrics: cpu {:.1}%, memory {:.1}%, disk write {:.2} MB/s",
            metrics.cpu_percent, metrics.memory_percent, metrics.disk_write_mbps
        );
        Ok(metrics)
    }
}
