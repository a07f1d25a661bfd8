//! Evenly spaced frame dropping.
//!
//! Dropping a fraction `f` of frames is done by dropping every
//! `round(1 / f)`-th frame, so a 25 % target drops frames 4, 8, 12, ...
//! instead of four frames in a row.

use serde::{Deserialize, Serialize};

/// Counters reported in the load status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameDropStats {
    pub frames_seen: u64,
    pub frames_dropped: u64,
    pub target_fraction: f64,
}

impl FrameDropStats {
    pub fn actual_fraction(&self) -> f64 {
        if self.frames_seen == 0 {
            0.0
        } else {
            self.frames_dropped as f64 / self.frames_seen as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct FrameDropper {
    fraction: f64,
    interval: Option<u64>,
    frames_seen: u64,
    frames_dropped: u64,
}

impl FrameDropper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the target fraction, clamped to `[0, 1]`.  Returns `true` if it changed.
    pub fn set_fraction(&mut self, fraction: f64) -> bool {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if fraction == self.fraction {
            return false;
        }
        self.fraction = fraction;
        self.interval = if fraction > 0.0 {
            Some(((1.0 / fraction).round() as u64).max(1))
        } else {
            None
        };
        true
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    /// Counts one frame and decides whether to drop it.
    pub fn should_drop(&mut self) -> bool {
        self.frames_seen += 1;
        match self.interval {
            Some(interval) if self.frames_seen % interval == 0 => {
                self.frames_dropped += 1;
                true
            }
            _ => false,
        }
    }

    pub fn stats(&self) -> FrameDropStats {
        FrameDropStats {
            frames_seen: self.frames_seen,
            frames_dropped: self.frames_dropped,
            target_fraction: self.fraction,
        }
    }

    pub fn reset_stats(&mut self) {
        self.frames_seen = 0;
        self.frames_dropped = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quarter_fraction_drops_every_fourth_frame() {
        // Arrange
        let mut dropper = FrameDropper::new();
        dropper.set_fraction(0.25);

        // Act
        let pattern: Vec<bool> = (0..8).map(|_| dropper.should_drop()).collect();

        // Assert
        assert_eq!(pattern, [false, false, false, true, false, false, false, true]);
        assert_eq!(dropper.stats().actual_fraction(), 0.25);
    }

    #[test]
    fn test_zero_fraction_never_drops() {
        let mut dropper = FrameDropper::new();
        assert!((0..100).all(|_| !dropper.should_drop()));
        assert_eq!(dropper.stats().frames_seen, 100);
    }

    #[test]
    fn test_interval_is_rounded_not_truncated() {
        // 1 / 0.3 = 3.33 -> every 3rd frame
        let mut dropper = FrameDropper::new();
        dropper.set_fraction(0.3);
        let dropped = (0..30).filter(|_| dropper.should_drop()).count();
        assert_eq!(dropped, 10);
    }

    #[test]
    fn test_set_fraction_reports_change_and_clamps() {
        let mut dropper = FrameDropper::new();
        assert!(dropper.set_fraction(2.0));
        assert_eq!(dropper.fraction(), 1.0);
        assert!(!dropper.set_fraction(1.0));
        assert!(dropper.should_drop());
    }

    #[test]
    fn test_reset_stats_keeps_fraction() {
        let mut dropper = FrameDropper::new();
        dropper.set_fraction(0.5);
        dropper.should_drop();
        dropper.reset_stats();
        assert_eq!(dropper.stats().frames_seen, 0);
        assert_eq!(dropper.stats().target_fraction, 0.5);
    }
}
