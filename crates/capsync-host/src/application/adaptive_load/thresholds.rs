//! Metric cut points and performance-level classification.

use capsync_core::PerformanceLevel;
use serde::{Deserialize, Serialize};

/// Three cut points for one metric.
///
/// For "higher is worse" metrics (CPU, memory, queue depth) a value at or
/// above `critical` is critical, and so on down.  For "lower is worse"
/// metrics (disk-write throughput) the cut points run the other way and
/// [`level_for_inverse`](Self::level_for_inverse) is used.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricThresholds {
    pub good: f64,
    pub degraded: f64,
    pub critical: f64,
}

impl MetricThresholds {
    pub const fn new(good: f64, degraded: f64, critical: f64) -> Self {
        Self {
            good,
            degraded,
            critical,
        }
    }

    /// Level for a metric where larger values mean more load.
    pub fn level_for(&self, value: f64) -> PerformanceLevel {
        if value >= self.critical {
            PerformanceLevel::Critical
        } else if value >= self.degraded {
            PerformanceLevel::Degraded
        } else if value >= self.good {
            PerformanceLevel::Good
        } else {
            PerformanceLevel::Optimal
        }
    }

    /// Level for a metric where smaller values mean more load.
    pub fn level_for_inverse(&self, value: f64) -> PerformanceLevel {
        if value <= self.critical {
            PerformanceLevel::Critical
        } else if value <= self.degraded {
            PerformanceLevel::Degraded
        } else if value <= self.good {
            PerformanceLevel::Good
        } else {
            PerformanceLevel::Optimal
        }
    }
}

/// Cut points for every sampled metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceThresholds {
    #[serde(default = "default_cpu")]
    pub cpu_percent: MetricThresholds,
    #[serde(default = "default_memory")]
    pub memory_percent: MetricThresholds,
    /// MB/s; lower is worse.
    #[serde(default = "default_disk_write")]
    pub disk_write_mbps: MetricThresholds,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: MetricThresholds,
}

fn default_cpu() -> MetricThresholds {
    MetricThresholds::new(60.0, 75.0, 90.0)
}
fn default_memory() -> MetricThresholds {
    MetricThresholds::new(70.0, 85.0, 95.0)
}
fn default_disk_write() -> MetricThresholds {
    MetricThresholds::new(50.0, 20.0, 10.0)
}
fn default_queue_depth() -> MetricThresholds {
    MetricThresholds::new(100.0, 500.0, 1000.0)
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: default_cpu(),
            memory_percent: default_memory(),
            disk_write_mbps: default_disk_write(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// One sample of host resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Measured write throughput; `0.0` when nothing was written.
    pub disk_write_mbps: f64,
}

/// Depth of one registered queue at sampling time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub name: String,
    pub depth: usize,
    pub capacity: usize,
}

impl QueueDepth {
    pub fn new(name: impl Into<String>, depth: usize, capacity: usize) -> Self {
        Self {
            name: name.into(),
            depth,
            capacity,
        }
    }

    /// Fraction of capacity in use.  An unbounded (zero-capacity) queue is never full.
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.depth as f64 / self.capacity as f64
        }
    }
}

impl PerformanceThresholds {
    /// The worst level any single metric implies.
    ///
    /// Disk throughput only counts when something was actually written; an
    /// idle disk reporting 0 MB/s is not a bottleneck.
    pub fn determine_level(&self, metrics: &HostMetrics, queues: &[QueueDepth]) -> PerformanceLevel {
        let mut level = self
            .cpu_percent
            .level_for(metrics.cpu_percent)
            .max(self.memory_percent.level_for(metrics.memory_percent));

        if metrics.disk_write_mbps > 0.0 {
            level = level.max(self.disk_write_mbps.level_for_inverse(metrics.disk_write_mbps));
        }
        for queue in queues {
            level = level.max(self.queue_depth.level_for(queue.depth as f64));
        }
        level
    }
}
