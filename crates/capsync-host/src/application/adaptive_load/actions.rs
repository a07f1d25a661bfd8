//! Degradation actions and the default action table.

use capsync_core::PerformanceLevel;
use serde::{Deserialize, Serialize};

/// What an action does while active.  Factors are multiplicative, `0 < f <= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DegradationStrategy {
    FrameDrop { fraction: f64 },
    QualityScale { factor: f64 },
    ResolutionScale { factor: f64 },
    FrameRateScale { factor: f64 },
    DisablePreview,
    DisableNonEssential,
    ReclaimMemory,
}

/// One entry of the action table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationAction {
    pub name: String,
    /// Becomes active at this level and above.
    pub level: PerformanceLevel,
    /// Activation order within a level, lowest first.
    pub priority: u8,
    pub strategy: DegradationStrategy,
}

impl DegradationAction {
    pub fn new(
        name: impl Into<String>,
        level: PerformanceLevel,
        priority: u8,
        strategy: DegradationStrategy,
    ) -> Self {
        Self {
            name: name.into(),
            level,
            priority,
            strategy,
        }
    }

    /// `true` if this action belongs in the active set at `level`.
    pub fn applies_at(&self, level: PerformanceLevel) -> bool {
        self.level > PerformanceLevel::Optimal && self.level <= level
    }
}

/// The built-in table: gentle measures at `degraded`, aggressive ones at
/// `critical`.
pub fn default_actions() -> Vec<DegradationAction> {
    use DegradationStrategy::*;
    use PerformanceLevel::{Critical, Degraded};

    vec![
        DegradationAction::new("disable_preview", Degraded, 1, DisablePreview),
        DegradationAction::new("light_frame_drop", Degraded, 2, FrameDrop { fraction: 0.10 }),
        DegradationAction::new("reduce_quality", Degraded, 3, QualityScale { factor: 0.7 }),
        DegradationAction::new("heavy_frame_drop", Critical, 1, FrameDrop { fraction: 0.25 }),
        DegradationAction::new("reduce_resolution", Critical, 2, ResolutionScale { factor: 0.67 }),
        DegradationAction::new("halve_frame_rate", Critical, 3, FrameRateScale { factor: 0.5 }),
        DegradationAction::new("disable_non_essential", Critical, 4, DisableNonEssential),
        DegradationAction::new("reclaim_memory", Critical, 5, ReclaimMemory),
    ]
}

/// Sorts actions into activation order: least severe level first, then priority.
pub fn activation_order(actions: &mut [DegradationAction]) {
    actions.sort_by(|a, b| (a.level, a.priority).cmp(&(b.level, b.priority)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_has_no_optimal_or_good_actions() {
        assert!(default_actions()
            .iter()
            .all(|a| a.level >= PerformanceLevel::Degraded));
    }

    #[test]
    fn test_applies_at_includes_lower_severity_actions() {
        // Arrange
        let degraded = DegradationAction::new(
            "x",
            PerformanceLevel::Degraded,
            1,
            DegradationStrategy::DisablePreview,
        );

        // Act / Assert
        assert!(!degraded.applies_at(PerformanceLevel::Good));
        assert!(degraded.applies_at(PerformanceLevel::Degraded));
        assert!(degraded.applies_at(PerformanceLevel::Critical));
    }

    #[test]
    fn test_activation_order_sorts_by_level_then_priority() {
        let mut actions = default_actions();
        actions.reverse();
        activation_order(&mut actions);
        let names: Vec<_> = actions.iter().take(4).map(|a| a.name.as_str()).collect();
        assert_eq!(
            names,
            ["disable_preview", "light_frame_drop", "reduce_quality", "heavy_frame_drop"]
        );
    }
}
