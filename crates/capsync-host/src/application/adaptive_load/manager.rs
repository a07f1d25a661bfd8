//! AdaptiveLoadManager: turns host metrics into degradation decisions.
//!
//! Each tick the manager:
//!
//! 1. Samples CPU, memory, and disk-write throughput through a
//!    [`MetricsSource`], and every registered queue's depth through a
//!    [`QueueSource`].
//! 2. Classifies the tick as the worst level any single metric implies.
//! 3. Reconciles the active action set against that level, so moving
//!    `critical -> degraded` reverts exactly the critical-only actions.
//! 4. Independently of the level, reacts to any queue above the
//!    backpressure ratio with an emergency frame drop.
//! 5. Pushes an advisory quality tier to every device through a
//!    [`QualityAdvisor`].
//!
//! The manager never touches encoders or sockets.  Callers ask it to
//! [`adapt`](AdaptiveLoadManager::adapt) their baseline settings and whether
//! to [`drop`](AdaptiveLoadManager::should_drop_frame) the next frame.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use capsync_core::protocol::messages::now_secs;
use capsync_core::{PerformanceLevel, QualityTier};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::actions::{activation_order, default_actions, DegradationAction, DegradationStrategy};
use super::frame_drop::{FrameDropStats, FrameDropper};
use super::thresholds::{HostMetrics, PerformanceThresholds, QueueDepth};
use crate::application::events::{EventBus, HostEvent};
use crate::application::orchestrate_session::FrameGate;
use crate::sync::{lock, read, write};

const MIN_QUALITY_FACTOR: f64 = 0.1;
const MIN_RESOLUTION_FACTOR: f64 = 0.25;
const MIN_FRAME_RATE_FACTOR: f64 = 0.1;

// ── Seams ─────────────────────────────────────────────────────────────────────

/// Error returned when host metrics cannot be read.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics unavailable: {0}")]
    Unavailable(String),
}

/// Source of host resource metrics.
///
/// The production implementation wraps `sysinfo`; tests use the generated
/// `MockMetricsSource`.
#[cfg_attr(test, mockall::automock)]
pub trait MetricsSource: Send {
    fn sample(&mut self) -> Result<HostMetrics, MetricsError>;
}

/// Anything that can report the depths of the queues it owns.
#[async_trait]
pub trait QueueSource: Send + Sync {
    async fn queue_depths(&self) -> Vec<QueueDepth>;
}

/// Receiver of the host-wide quality tier, typically the connection registry.
#[async_trait]
pub trait QualityAdvisor: Send + Sync {
    async fn apply_quality(&self, host_tier: QualityTier);
}

// ── Configuration and reports ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub thresholds: PerformanceThresholds,
    pub actions: Vec<DegradationAction>,
    /// Fill ratio above which a queue triggers the emergency drop.
    pub backpressure_ratio: f64,
    pub emergency_drop_fraction: f64,
    /// Level assumed for a tick whose metrics could not be sampled.
    pub fallback_level: PerformanceLevel,
    pub history_len: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            thresholds: PerformanceThresholds::default(),
            actions: default_actions(),
            backpressure_ratio: 0.8,
            emergency_drop_fraction: 0.3,
            fallback_level: PerformanceLevel::Degraded,
            history_len: 60,
        }
    }
}

/// Encoder settings supplied by a caller and returned scaled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// JPEG-style quality, 0-100.
    pub quality: u8,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            quality: 85,
            width: 1920,
            height: 1080,
            frame_rate: 30.0,
        }
    }
}

/// Multiplicative factors currently in force.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectiveFactors {
    pub quality: f64,
    pub resolution: f64,
    pub frame_rate: f64,
}

impl Default for EffectiveFactors {
    fn default() -> Self {
        Self {
            quality: 1.0,
            resolution: 1.0,
            frame_rate: 1.0,
        }
    }
}

/// One tick's sample as kept in the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub at: f64,
    /// `None` when sampling failed.
    pub metrics: Option<HostMetrics>,
    pub level: PerformanceLevel,
}

/// What one tick decided.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub previous: PerformanceLevel,
    pub level: PerformanceLevel,
    pub activated: Vec<String>,
    pub deactivated: Vec<String>,
    pub hot_queues: Vec<QueueDepth>,
    pub emergency_drop_active: bool,
}

impl TickReport {
    pub fn level_changed(&self) -> bool {
        self.previous != self.level
    }
}

/// Snapshot for status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadStatus {
    pub level: PerformanceLevel,
    pub active_actions: Vec<String>,
    pub emergency_drop: Option<f64>,
    pub frame_drops: FrameDropStats,
    pub factors: EffectiveFactors,
    pub preview_enabled: bool,
    pub non_essential_enabled: bool,
    pub last_metrics: Option<HostMetrics>,
    pub history_len: usize,
}

// ── Manager ───────────────────────────────────────────────────────────────────

struct LoadState {
    level: PerformanceLevel,
    active: Vec<DegradationAction>,
    emergency_drop: Option<f64>,
    dropper: FrameDropper,
    factors: EffectiveFactors,
    preview_enabled: bool,
    non_essential_enabled: bool,
    last_metrics: Option<HostMetrics>,
    history: VecDeque<MetricsRecord>,
}

impl LoadState {
    fn new() -> Self {
        Self {
            level: PerformanceLevel::Optimal,
            active: Vec::new(),
            emergency_drop: None,
            dropper: FrameDropper::new(),
            factors: EffectiveFactors::default(),
            preview_enabled: true,
            non_essential_enabled: true,
            last_metrics: None,
            history: VecDeque::new(),
        }
    }

    /// Derives every effect from the active set.  Calling it twice with the
    /// same set gives the same state.
    fn recompute(&mut self) {
        let mut drop_fraction = self.emergency_drop.unwrap_or(0.0);
        let mut factors = EffectiveFactors::default();
        let mut preview_enabled = true;
        let mut non_essential_enabled = true;

        for action in &self.active {
            match action.strategy {
                DegradationStrategy::FrameDrop { fraction } => {
                    drop_fraction = drop_fraction.max(fraction)
                }
                DegradationStrategy::QualityScale { factor } => {
                    factors.quality = factors.quality.min(factor)
                }
                DegradationStrategy::ResolutionScale { factor } => {
                    factors.resolution = factors.resolution.min(factor)
                }
                DegradationStrategy::FrameRateScale { factor } => {
                    factors.frame_rate = factors.frame_rate.min(factor)
                }
                DegradationStrategy::DisablePreview => preview_enabled = false,
                DegradationStrategy::DisableNonEssential => non_essential_enabled = false,
                DegradationStrategy::ReclaimMemory => {}
            }
        }

        factors.quality = factors.quality.clamp(MIN_QUALITY_FACTOR, 1.0);
        factors.resolution = factors.resolution.clamp(MIN_RESOLUTION_FACTOR, 1.0);
        factors.frame_rate = factors.frame_rate.clamp(MIN_FRAME_RATE_FACTOR, 1.0);

        if self.dropper.set_fraction(drop_fraction) {
            info!("frame drop fraction set to {drop_fraction:.2}");
        }
        self.factors = factors;
        self.preview_enabled = preview_enabled;
        self.non_essential_enabled = non_essential_enabled;
    }
}

type ReclaimHook = Arc<dyn Fn() + Send + Sync>;

/// Host-wide load classifier and degradation policy.
pub struct AdaptiveLoadManager {
    config: AdaptiveConfig,
    state: Mutex<LoadState>,
    events: Arc<EventBus>,
    reclaim_hooks: RwLock<Vec<ReclaimHook>>,
}

impl AdaptiveLoadManager {
    pub fn new(mut config: AdaptiveConfig, events: Arc<EventBus>) -> Self {
        activation_order(&mut config.actions);
        Self {
            config,
            state: Mutex::new(LoadState::new()),
            events,
            reclaim_hooks: RwLock::new(Vec::new()),
        }
    }

    /// Registers a callback run whenever a memory-reclaim action activates.
    pub fn on_reclaim(&self, hook: impl Fn() + Send + Sync + 'static) {
        write(&self.reclaim_hooks).push(Arc::new(hook));
    }

    /// Applies one tick's observations.
    ///
    /// A failed sample does not abort the tick; the configured fallback level
    /// is used instead.
    pub fn evaluate(
        &self,
        sample: Result<HostMetrics, MetricsError>,
        queues: &[QueueDepth],
    ) -> TickReport {
        let metrics = match sample {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                warn!(
                    "metric sampling failed ({e}); assuming {}",
                    self.config.fallback_level
                );
                None
            }
        };
        let level = match &metrics {
            Some(m) => self.config.thresholds.determine_level(m, queues),
            None => self.config.fallback_level,
        };

        let hot_queues: Vec<QueueDepth> = queues
            .iter()
            .filter(|q| q.fill_ratio() > self.config.backpressure_ratio)
            .cloned()
            .collect();

        let desired: Vec<DegradationAction> = self
            .config
            .actions
            .iter()
            .filter(|a| a.applies_at(level))
            .cloned()
            .collect();

        let (report, reclaim) = {
            let mut state = lock(&self.state);
            let previous = state.level;

            let activated: Vec<String> = desired
                .iter()
                .filter(|d| !state.active.iter().any(|a| a.name == d.name))
                .map(|d| d.name.clone())
                .collect();
            let deactivated: Vec<String> = state
                .active
                .iter()
                .filter(|a| !desired.iter().any(|d| d.name == a.name))
                .map(|a| a.name.clone())
                .collect();
            let reclaim = desired.iter().any(|d| {
                matches!(d.strategy, DegradationStrategy::ReclaimMemory)
                    && activated.contains(&d.name)
            });

            state.level = level;
            state.active = desired;
            state.emergency_drop = if hot_queues.is_empty() {
                None
            } else {
                Some(self.config.emergency_drop_fraction)
            };
            state.recompute();

            if metrics.is_some() {
                state.last_metrics = metrics;
            }
            if state.history.len() >= self.config.history_len.max(1) {
                state.history.pop_front();
            }
            state.history.push_back(MetricsRecord {
                at: now_secs(),
                metrics,
                level,
            });

            let report = TickReport {
                previous,
                level,
                activated,
                deactivated,
                hot_queues,
                emergency_drop_active: state.emergency_drop.is_some(),
            };
            (report, reclaim)
        };

        if report.level_changed() {
            info!(
                "performance level {} -> {} (activated {:?}, reverted {:?})",
                report.previous, report.level, report.activated, report.deactivated
            );
            self.events.publish(HostEvent::PerformanceLevelChanged {
                from: report.previous,
                to: report.level,
            });
        }
        for queue in &report.hot_queues {
            warn!(
                "backpressure on {}: {}/{} queued",
                queue.name, queue.depth, queue.capacity
            );
            self.events.publish(HostEvent::Backpressure {
                queue: queue.name.clone(),
                depth: queue.depth,
                capacity: queue.capacity,
            });
        }
        if reclaim {
            self.run_reclaim_hooks();
        }
        report
    }

    /// Samples, evaluates, and pushes the resulting quality tier.
    pub async fn tick(
        &self,
        source: &mut dyn MetricsSource,
        queues: &dyn QueueSource,
        advisor: &dyn QualityAdvisor,
    ) -> TickReport {
        let depths = queues.queue_depths().await;
        let report = self.evaluate(source.sample(), &depths);
        advisor.apply_quality(QualityTier::for_level(report.level)).await;
        report
    }

    /// Scales caller-supplied baseline settings by the factors in force.
    pub fn adapt(&self, baseline: StreamSettings) -> StreamSettings {
        let factors = lock(&self.state).factors;
        StreamSettings {
            quality: (f64::from(baseline.quality) * factors.quality) as u8,
            width: (f64::from(baseline.width) * factors.resolution) as u32,
            height: (f64::from(baseline.height) * factors.resolution) as u32,
            frame_rate: baseline.frame_rate * factors.frame_rate,
        }
    }

    /// Counts one frame and says whether to drop it.
    pub fn should_drop_frame(&self) -> bool {
        lock(&self.state).dropper.should_drop()
    }

    pub fn preview_enabled(&self) -> bool {
        lock(&self.state).preview_enabled
    }

    pub fn non_essential_enabled(&self) -> bool {
        lock(&self.state).non_essential_enabled
    }

    pub fn current_level(&self) -> PerformanceLevel {
        lock(&self.state).level
    }

    pub fn active_actions(&self) -> Vec<String> {
        lock(&self.state)
            .active
            .iter()
            .map(|a| a.name.clone())
            .collect()
    }

    pub fn metrics_history(&self) -> Vec<MetricsRecord> {
        lock(&self.state).history.iter().cloned().collect()
    }

    pub fn reset_frame_stats(&self) {
        lock(&self.state).dropper.reset_stats();
    }

    pub fn status(&self) -> LoadStatus {
        let state = lock(&self.state);
        LoadStatus {
            level: state.level,
            active_actions: state.active.iter().map(|a| a.name.clone()).collect(),
            emergency_drop: state.emergency_drop,
            frame_drops: state.dropper.stats(),
            factors: state.factors,
            preview_enabled: state.preview_enabled,
            non_essential_enabled: state.non_essential_enabled,
            last_metrics: state.last_metrics,
            history_len: state.history.len(),
        }
    }

    /// Memory reclaim: clears the frame counters, then runs the registered hooks.
    fn run_reclaim_hooks(&self) {
        self.reset_frame_stats();
        let hooks: Vec<ReclaimHook> = read(&self.reclaim_hooks).iter().cloned().collect();
        debug!("running {} memory reclaim hook(s)", hooks.len());
        for hook in hooks {
            hook();
        }
    }
}

impl FrameGate for AdaptiveLoadManager {
    fn admit_preview_frame(&self) -> bool {
        let mut state = lock(&self.state);
        state.preview_enabled && !state.dropper.should_drop()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
