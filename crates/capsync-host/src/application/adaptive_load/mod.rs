//! Adaptive load management.
//!
//! - **`thresholds`** – per-metric cut points and level classification.
//! - **`actions`** – the degradation action table.
//! - **`frame_drop`** – evenly spaced frame dropping.
//! - **`manager`** – the tick loop tying them together.

pub mod actions;
pub mod frame_drop;
pub mod manager;
pub mod thresholds;

pub use actions::{default_actions, DegradationAction, DegradationStrategy};
pub use frame_drop::{FrameDropStats, FrameDropper};
pub use manager::{
    AdaptiveConfig, AdaptiveLoadManager, EffectiveFactors, LoadStatus, MetricsError,
    MetricsRecord, MetricsSource, QualityAdvisor, QueueSource, StreamSettings, TickReport,
};
pub use thresholds::{HostMetrics, MetricThresholds, PerformanceThresholds, QueueDepth};
