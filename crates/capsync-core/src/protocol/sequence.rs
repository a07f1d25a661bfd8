//! Thread-safe enqueue counter.
//!
//! The outbound queue orders messages by priority first and by arrival
//! second.  Arrival order is captured by stamping each enqueued item with a
//! value from a [`SequenceCounter`]; within one priority tier the smaller
//! stamp is delivered first.
//!
//! The counter is an `AtomicU64`, so producers on different tasks can stamp
//! items without taking a lock.

use std::sync::atomic::{AtomicU64, Ordering};

/// A lock-free, monotonically increasing counter.
///
/// # Examples
///
/// ```rust
/// use capsync_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// ```
#[derive(Debug, Default)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    /// Creates a new counter starting at 0.
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
        }
    }

    /// Returns the next stamp and advances the counter.
    ///
    /// Wraps from `u64::MAX` to 0.  `Relaxed` is enough because the value
    /// only orders items, it does not publish other memory.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the value the next call to [`next`](Self::next) will hand out.
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sequence_counter_starts_at_zero() {
        let counter = SequenceCounter::new();
        assert_eq!(counter.next(), 0);
    }

    #[test]
    fn test_sequence_counter_wraps_at_u64_max() {
        // Arrange
        let counter = SequenceCounter {
            inner: AtomicU64::new(u64::MAX),
        };

        // Act / Assert
        assert_eq!(counter.next(), u64::MAX);
        assert_eq!(counter.next(), 0);
    }

    #[test]
    fn test_sequence_counter_hands_out_unique_stamps_across_threads() {
        // Arrange
        let counter = Arc::new(SequenceCounter::new());

        // Act
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&counter);
                thread::spawn(move || (0..500).map(|_| c.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut stamps: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        // Assert
        stamps.sort_unstable();
        stamps.dedup();
        assert_eq!(stamps.len(), 2000);
        assert_eq!(counter.current(), 2000);
    }
}
