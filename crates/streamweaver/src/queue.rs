//! Bounded per-session event queue with configurable overflow handling.
//!
//! Unlike a plain channel, a full queue can shed load instead of blocking
//! indefinitely: the overflow policy decides whether `put` waits, evicts
//! the oldest element, or discards the new one.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

use crate::error::RecvTimeout;
use crate::events::StreamEvent;

/// Policy for handling queue overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Block until space is available.
    Block,
    /// Drop the oldest queued event when full.
    #[default]
    DropOldest,
    /// Discard the incoming event when full.
    DropNewest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "block" => Ok(Self::Block),
            "drop_oldest" => Ok(Self::DropOldest),
            "drop_newest" => Ok(Self::DropNewest),
            other => Err(format!("unknown overflow policy: {other}")),
        }
    }
}

/// Async FIFO queue with backpressure handling.
///
/// `max_size == 0` means unbounded. FIFO order is preserved for accepted
/// events; `dropped_count` is monotonic between resets.
#[derive(Debug)]
pub struct BoundedQueue {
    max_size: usize,
    policy: OverflowPolicy,
    items: Mutex<VecDeque<StreamEvent>>,
    // Mirrors items.len() so observers never need the lock.
    len: AtomicUsize,
    not_empty: Notify,
    not_full: Notify,
    dropped: AtomicU64,
}

impl BoundedQueue {
    /// Create a queue with the given bound and overflow policy.
    #[must_use]
    pub fn new(max_size: usize, policy: OverflowPolicy) -> Self {
        Self {
            max_size,
            policy,
            items: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Put an event into the queue.
    ///
    /// Returns `true` if the event was accepted, `false` if it was dropped
    /// under [`OverflowPolicy::DropNewest`]. Under [`OverflowPolicy::Block`]
    /// this suspends until a consumer frees a slot; dropping the future
    /// before then leaves the queue unchanged and the event unqueued.
    pub async fn put(&self, event: StreamEvent) -> bool {
        loop {
            let not_full = self.not_full.notified();
            {
                let mut items = self.items.lock().await;
                if self.max_size == 0 || items.len() < self.max_size {
                    items.push_back(event);
                    self.len.store(items.len(), Ordering::Release);
                    drop(items);
                    self.not_empty.notify_one();
                    return true;
                }

                match self.policy {
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                        items.push_back(event);
                        self.len.store(items.len(), Ordering::Release);
                        drop(items);
                        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::debug!(total_dropped = dropped, "dropped oldest event");
                        self.not_empty.notify_one();
                        return true;
                    }
                    OverflowPolicy::DropNewest => {
                        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::debug!(total_dropped = dropped, "dropped newest event");
                        return false;
                    }
                    OverflowPolicy::Block => {}
                }
            }
            // Queue is full under Block: wait for a get to free a slot.
            not_full.await;
        }
    }

    /// Get the next event in FIFO order.
    ///
    /// With a timeout, fails with [`RecvTimeout`] once the deadline passes.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<StreamEvent, RecvTimeout> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.recv())
                .await
                .map_err(|_| RecvTimeout(limit)),
            None => Ok(self.recv().await),
        }
    }

    async fn recv(&self) -> StreamEvent {
        loop {
            let not_empty = self.not_empty.notified();
            {
                let mut items = self.items.lock().await;
                if let Some(event) = items.pop_front() {
                    self.len.store(items.len(), Ordering::Release);
                    drop(items);
                    self.not_full.notify_one();
                    return event;
                }
            }
            not_empty.await;
        }
    }

    /// Get an event without waiting, if one is immediately available.
    #[must_use]
    pub fn try_get(&self) -> Option<StreamEvent> {
        let mut items = self.items.try_lock().ok()?;
        let event = items.pop_front()?;
        self.len.store(items.len(), Ordering::Release);
        drop(items);
        self.not_full.notify_one();
        Some(event)
    }

    /// Number of events currently queued.
    #[must_use]
    pub fn size(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether the queue is at its bound. Always `false` when unbounded.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.max_size > 0 && self.size() >= self.max_size
    }

    /// Configured bound. `0` means unbounded.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Configured overflow policy.
    #[must_use]
    pub const fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Number of events dropped due to backpressure since the last reset.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Reset the dropped count, returning the previous value.
    pub fn reset_dropped_count(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }

    /// Remove all queued events, returning how many were cleared.
    pub async fn clear(&self) -> usize {
        let mut items = self.items.lock().await;
        let count = items.len();
        items.clear();
        self.len.store(0, Ordering::Release);
        drop(items);
        self.not_full.notify_one();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;

    fn event(message: &str) -> StreamEvent {
        StreamEvent::new(EventType::StepProgress, "s1", message)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = BoundedQueue::new(10, OverflowPolicy::DropOldest);
        for name in ["a", "b", "c"] {
            assert!(queue.put(event(name)).await);
        }

        assert_eq!(queue.size(), 3);
        for expected in ["a", "b", "c"] {
            let got = queue.get(Some(Duration::from_secs(1))).await.expect("event");
            assert_eq!(got.message, expected);
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drop_oldest_under_burst() {
        let queue = BoundedQueue::new(3, OverflowPolicy::DropOldest);
        for name in ["e1", "e2", "e3", "e4", "e5"] {
            assert!(queue.put(event(name)).await);
        }

        assert_eq!(queue.size(), 3);
        assert_eq!(queue.dropped_count(), 2);

        for expected in ["e3", "e4", "e5"] {
            let got = queue.get(Some(Duration::from_secs(1))).await.expect("event");
            assert_eq!(got.message, expected);
        }
    }

    #[tokio::test]
    async fn test_drop_newest_under_burst() {
        let queue = BoundedQueue::new(3, OverflowPolicy::DropNewest);
        assert!(queue.put(event("e1")).await);
        assert!(queue.put(event("e2")).await);
        assert!(queue.put(event("e3")).await);
        assert!(!queue.put(event("e4")).await);
        assert!(!queue.put(event("e5")).await);

        assert_eq!(queue.size(), 3);
        assert_eq!(queue.dropped_count(), 2);

        for expected in ["e1", "e2", "e3"] {
            let got = queue.get(Some(Duration::from_secs(1))).await.expect("event");
            assert_eq!(got.message, expected);
        }
    }

    #[tokio::test]
    async fn test_get_timeout() {
        let queue = BoundedQueue::new(3, OverflowPolicy::DropOldest);
        let result = queue.get(Some(Duration::from_millis(20))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_consumer() {
        let queue = std::sync::Arc::new(BoundedQueue::new(1, OverflowPolicy::Block));
        assert!(queue.put(event("first")).await);
        assert!(queue.is_full());

        let producer = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.put(event("second")).await })
        };

        // The blocked put completes once the consumer frees a slot.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let first = queue.get(Some(Duration::from_secs(1))).await.expect("event");
        assert_eq!(first.message, "first");

        assert!(producer.await.expect("join"));
        let second = queue.get(Some(Duration::from_secs(1))).await.expect("event");
        assert_eq!(second.message, "second");
        assert_eq!(queue.dropped_count(), 0);
    }

    #[tokio::test]
    async fn test_bound_never_exceeded() {
        let queue = BoundedQueue::new(4, OverflowPolicy::DropOldest);
        for step in 0..50 {
            queue.put(event(&format!("e{step}"))).await;
            assert!(queue.size() <= 4);
        }
    }

    #[tokio::test]
    async fn test_try_get() {
        let queue = BoundedQueue::new(3, OverflowPolicy::DropOldest);
        assert!(queue.try_get().is_none());

        queue.put(event("only")).await;
        let got = queue.try_get().expect("event");
        assert_eq!(got.message, "only");
        assert!(queue.try_get().is_none());
    }

    #[tokio::test]
    async fn test_clear_and_reset() {
        let queue = BoundedQueue::new(2, OverflowPolicy::DropOldest);
        queue.put(event("a")).await;
        queue.put(event("b")).await;
        queue.put(event("c")).await;

        assert_eq!(queue.clear().await, 2);
        assert!(queue.is_empty());
        assert_eq!(queue.reset_dropped_count(), 1);
        assert_eq!(queue.dropped_count(), 0);
    }

    #[tokio::test]
    async fn test_unbounded_queue_never_full() {
        let queue = BoundedQueue::new(0, OverflowPolicy::DropOldest);
        for step in 0..2000 {
            assert!(queue.put(event(&format!("e{step}"))).await);
        }
        assert!(!queue.is_full());
        assert_eq!(queue.size(), 2000);
        assert_eq!(queue.dropped_count(), 0);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("block".parse::<OverflowPolicy>(), Ok(OverflowPolicy::Block));
        assert_eq!("drop_oldest".parse::<OverflowPolicy>(), Ok(OverflowPolicy::DropOldest));
        assert_eq!("drop_newest".parse::<OverflowPolicy>(), Ok(OverflowPolicy::DropNewest));
        assert!("spill".parse::<OverflowPolicy>().is_err());
    }
}
