//! Per-device link statistics.
//!
//! Latency here is one-way: host receive time minus the sender's `timestamp`
//! field.  Device and host clocks are not synchronised, so the absolute value
//! is only indicative; the *spread* (jitter) and the trend are what matter.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::domain::performance::QualityTier;

/// Number of latency samples kept per device.
pub const LATENCY_WINDOW: usize = 100;

/// Bounded window of recent latency samples.
#[derive(Debug, Clone)]
pub struct LinkStats {
    samples: VecDeque<f64>,
    capacity: usize,
}

/// Aggregate view of a [`LinkStats`] window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkSummary {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Population standard deviation of the window.
    pub jitter_ms: f64,
    pub samples: usize,
}

impl LinkStats {
    pub fn new() -> Self {
        Self::with_capacity(LATENCY_WINDOW)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Adds one sample, evicting the oldest once the window is full.
    ///
    /// Non-finite values are ignored; negative values (clock skew) count as 0.
    pub fn record(&mut self, latency_ms: f64) {
        if !latency_ms.is_finite() {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms.max(0.0));
    }

    pub fn summary(&self) -> LinkSummary {
        let n = self.samples.len();
        if n == 0 {
            return LinkSummary::default();
        }
        let sum: f64 = self.samples.iter().sum();
        let avg = sum / n as f64;
        let min = self.samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let variance = self.samples.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / n as f64;
        LinkSummary {
            avg_ms: avg,
            min_ms: min,
            max_ms: max,
            jitter_ms: variance.sqrt(),
            samples: n,
        }
    }
}

impl Default for LinkStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Streaming tier a link can sustain given its error rate and latency.
///
/// - error rate above 10 % or latency above 200 ms: `Low`
/// - error rate below 5 % and latency below 50 ms: `High`
/// - anything in between: `Medium`
pub fn recommend_tier(error_rate: f64, latency_ms: f64) -> QualityTier {
    if error_rate > 0.1 || latency_ms > 200.0 {
        QualityTier::Low
    } else if error_rate < 0.05 && latency_ms < 50.0 {
        QualityTier::High
    } else {
        QualityTier::Medium
    }
}
