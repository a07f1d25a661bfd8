//! Bounded priority queue feeding one device's send loop.
//!
//! Ordering is priority first (critical > high > normal > low) and enqueue
//! order second.  A `BinaryHeap` is a max-heap, so [`QueuedMessage`] orders
//! by priority and then by *reversed* sequence stamp.
//!
//! When the queue is full, an incoming message may evict the newest entry of
//! the lowest tier, but only if that tier is strictly lower than its own.
//! Control traffic is therefore never refused because bulk data filled the
//! queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use capsync_core::protocol::SequenceCounter;
use capsync_core::{Message, MessagePriority};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::sync::lock;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("outbound queue is full")]
    Full,
    #[error("outbound queue is closed")]
    Closed,
}

#[derive(Debug)]
struct QueuedMessage {
    priority: MessagePriority,
    seq: u64,
    message: Message,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<QueuedMessage>,
    closed: bool,
}

#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    ready: Notify,
    capacity: usize,
    seq: SequenceCounter,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ready: Notify::new(),
            capacity: capacity.max(1),
            seq: SequenceCounter::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    /// Adds a message.
    ///
    /// # Errors
    ///
    /// [`EnqueueError::Closed`] after [`close`](Self::close);
    /// [`EnqueueError::Full`] when full and nothing lower-priority can be evicted.
    pub fn push(&self, message: Message, priority: MessagePriority) -> Result<(), EnqueueError> {
        {
            let mut inner = lock(&self.inner);
            if inner.closed {
                return Err(EnqueueError::Closed);
            }
            if inner.heap.len() >= self.capacity && !evict_lower(&mut inner.heap, priority) {
                return Err(EnqueueError::Full);
            }
            inner.heap.push(QueuedMessage {
                priority,
                seq: self.seq.next(),
                message,
            });
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Removes the next message without waiting.
    pub fn try_pop(&self) -> Option<Message> {
        lock(&self.inner).heap.pop().map(|q| q.message)
    }

    /// Waits for the next message.  Returns `None` once the queue is closed.
    ///
    /// Messages still queued when the queue closes are discarded.
    pub async fn pop(&self) -> Option<Message> {
        loop {
            let notified = self.ready.notified();
            {
                let mut inner = lock(&self.inner);
                if inner.closed {
                    return None;
                }
                if let Some(next) = inner.heap.pop() {
                    return Some(next.message);
                }
            }
            notified.await;
        }
    }

    /// Closes the queue and wakes the waiting consumer.
    pub fn close(&self) {
        lock(&self.inner).closed = true;
        self.ready.notify_waiters();
        self.ready.notify_one();
    }
}

/// Drops the newest message of the lowest tier if that tier is below
/// `incoming`.  Returns `true` if room was made.
fn evict_lower(heap: &mut BinaryHeap<QueuedMessage>, incoming: MessagePriority) -> bool {
    let victim = heap
        .iter()
        .filter(|q| q.priority < incoming)
        .min_by(|a, b| a.priority.cmp(&b.priority).then_with(|| b.seq.cmp(&a.seq)))
        .map(|q| (q.priority, q.seq));

    let Some((priority, seq)) = victim else {
        return false;
    };
    debug!("outbound queue full; evicting {priority:?} message #{seq}");
    let mut items = std::mem::take(heap).into_vec();
    items.retain(|q| q.seq != seq);
    *heap = BinaryHeap::from(items);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::sync::Arc;
    use std::time::Duration;

    fn named(name: &str) -> Message {
        let mut payload = Map::new();
        payload.insert("name".to_string(), name.into());
        Message::new("test", payload)
    }

    fn name_of(m: &Message) -> String {
        m.get_str("name").unwrap_or_default().to_string()
    }

    #[test]
    fn test_priority_then_fifo_order() {
        // Arrange
        let q = OutboundQueue::new(10);
        q.push(named("A"), MessagePriority::Low).unwrap();
        q.push(named("B"), MessagePriority::Critical).unwrap();
        q.push(named("C"), MessagePriority::Normal).unwrap();

        // Act
        let order: Vec<_> = std::iter::from_fn(|| q.try_pop()).map(|m| name_of(&m)).collect();

        // Assert
        assert_eq!(order, ["B", "C", "A"]);
    }

    #[test]
    fn test_same_priority_is_fifo() {
        let q = OutboundQueue::new(10);
        for name in ["1", "2", "3"] {
            q.push(named(name), MessagePriority::Normal).unwrap();
        }
        let order: Vec<_> = std::iter::from_fn(|| q.try_pop()).map(|m| name_of(&m)).collect();
        assert_eq!(order, ["1", "2", "3"]);
    }

    #[test]
    fn test_full_queue_evicts_newest_lowest_priority() {
        // Arrange
        let q = OutboundQueue::new(2);
        q.push(named("low-old"), MessagePriority::Low).unwrap();
        q.push(named("low-new"), MessagePriority::Low).unwrap();

        // Act
        q.push(named("ctrl"), MessagePriority::Critical).unwrap();

        // Assert
        let order: Vec<_> = std::iter::from_fn(|| q.try_pop()).map(|m| name_of(&m)).collect();
        assert_eq!(order, ["ctrl", "low-old"]);
    }

    #[test]
    fn test_full_queue_refuses_same_priority() {
        let q = OutboundQueue::new(1);
        q.push(named("a"), MessagePriority::Normal).unwrap();
        assert_eq!(q.push(named("b"), MessagePriority::Normal), Err(EnqueueError::Full));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_closed_queue_refuses_push() {
        let q = OutboundQueue::new(1);
        q.close();
        assert_eq!(q.push(named("a"), MessagePriority::Critical), Err(EnqueueError::Closed));
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        // Arrange
        let q = Arc::new(OutboundQueue::new(4));
        let producer = Arc::clone(&q);

        // Act
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(named("late"), MessagePriority::High).unwrap();
        });
        let popped = tokio::time::timeout(Duration::from_secs(1), q.pop()).await.unwrap();
        handle.await.unwrap();

        // Assert
        assert_eq!(popped.map(|m| name_of(&m)), Some("late".to_string()));
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumer() {
        let q = Arc::new(OutboundQueue::new(4));
        let closer = Arc::clone(&q);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });

        let popped = tokio::time::timeout(Duration::from_secs(1), q.pop()).await.unwrap();

        assert!(popped.is_none());
    }
}
