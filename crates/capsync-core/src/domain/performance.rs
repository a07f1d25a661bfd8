//! Host performance levels and streaming quality tiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Host-wide health classification.
///
/// Variants are declared best-first so the derived `Ord` gives
/// `Optimal < Good < Degraded < Critical`; "worse" always compares greater.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceLevel {
    #[default]
    Optimal,
    Good,
    Degraded,
    Critical,
}

impl PerformanceLevel {
    /// All levels, best first.
    pub const ALL: [PerformanceLevel; 4] = [
        PerformanceLevel::Optimal,
        PerformanceLevel::Good,
        PerformanceLevel::Degraded,
        PerformanceLevel::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Optimal => "optimal",
            Self::Good => "good",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for PerformanceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory streaming quality for one device.
///
/// Declared lowest-first so `min` picks the more conservative tier.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    #[default]
    High,
}

impl QualityTier {
    /// Preview frame rate a device should target at this tier.
    pub fn target_fps(self) -> u32 {
        match self {
            Self::Low => 5,
            Self::Medium => 15,
            Self::High => 30,
        }
    }

    /// Tier implied by the host's own performance level.
    pub fn for_level(level: PerformanceLevel) -> Self {
        match level {
            PerformanceLevel::Optimal | PerformanceLevel::Good => Self::High,
            PerformanceLevel::Degraded => Self::Medium,
            PerformanceLevel::Critical => Self::Low,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered_best_to_worst() {
        for pair in PerformanceLevel::ALL.windows(2) {
            assert!(pair[0] < pair[1], "{} must be better than {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_max_of_levels_is_the_worst() {
        let worst = [PerformanceLevel::Good, PerformanceLevel::Critical, PerformanceLevel::Optimal]
            .into_iter()
            .max();
        assert_eq!(worst, Some(PerformanceLevel::Critical));
    }

    #[test]
    fn test_tier_for_level_steps_down_with_severity() {
        assert_eq!(QualityTier::for_level(PerformanceLevel::Optimal), QualityTier::High);
        assert_eq!(QualityTier::for_level(PerformanceLevel::Good), QualityTier::High);
        assert_eq!(QualityTier::for_level(PerformanceLevel::Degraded), QualityTier::Medium);
        assert_eq!(QualityTier::for_level(PerformanceLevel::Critical), QualityTier::Low);
    }

    #[test]
    fn test_tier_min_is_most_conservative() {
        assert_eq!(QualityTier::High.min(QualityTier::Low), QualityTier::Low);
        assert_eq!(QualityTier::Medium.target_fps(), 15);
    }

    #[test]
    fn test_level_serializes_lowercase() {
        let json = serde_json::to_string(&PerformanceLevel::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }
}
