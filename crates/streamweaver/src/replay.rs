//! Event replay buffers for reconnection support.
//!
//! Clients that reconnect with `Last-Event-ID` resume from where they left
//! off: each session keeps a ring of its most recent events, indexed by
//! event ID for O(1) lookup.

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;

use crate::events::StreamEvent;

/// Ring buffer of recent events for a single session.
///
/// Each insertion is assigned the next logical position from a counter that
/// is never reset, so stale event IDs cannot collide with future ones after
/// the buffer is cleared.
#[derive(Debug)]
pub struct ReplayBuffer {
    max_size: usize,
    buffer: VecDeque<StreamEvent>,
    index: HashMap<String, u64>,
    next_position: u64,
}

impl ReplayBuffer {
    /// Create a buffer retaining at most `max_size` events.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            buffer: VecDeque::with_capacity(max_size),
            index: HashMap::with_capacity(max_size),
            next_position: 0,
        }
    }

    /// Add an event, evicting the oldest one when at capacity.
    pub fn add(&mut self, event: StreamEvent) {
        if self.max_size > 0 && self.buffer.len() >= self.max_size {
            if let Some(oldest) = self.buffer.pop_front() {
                self.index.remove(&oldest.event_id);
            }
        }

        self.index.insert(event.event_id.clone(), self.next_position);
        self.next_position += 1;
        self.buffer.push_back(event);
    }

    /// All buffered events strictly newer than `last_event_id`, in
    /// insertion order.
    ///
    /// Returns an empty sequence when the ID is not in the buffer (evicted
    /// or never seen).
    #[must_use]
    pub fn events_after(&self, last_event_id: &str) -> Vec<StreamEvent> {
        let Some(&target) = self.index.get(last_event_id) else {
            tracing::warn!(event_id = %last_event_id, "replay id not in buffer, may be too old");
            return Vec::new();
        };

        self.buffer
            .iter()
            .filter(|event| {
                self.index
                    .get(&event.event_id)
                    .is_some_and(|&position| position > target)
            })
            .cloned()
            .collect()
    }

    /// ID of the most recent event, if any.
    #[must_use]
    pub fn latest_event_id(&self) -> Option<&str> {
        self.buffer.back().map(|event| event.event_id.as_str())
    }

    /// Remove all events, returning how many were cleared.
    ///
    /// The position counter is deliberately left untouched.
    pub fn clear(&mut self) -> usize {
        let count = self.buffer.len();
        self.buffer.clear();
        self.index.clear();
        count
    }

    /// Number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

/// Per-session replay buffers behind one process-wide lock.
///
/// Only insertions and removals of sessions contend; per-event work is O(1).
#[derive(Debug)]
pub struct SessionBuffers {
    buffer_size: usize,
    buffers: Mutex<HashMap<String, ReplayBuffer>>,
}

impl SessionBuffers {
    /// Create a registry whose buffers retain `buffer_size` events each.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size, buffers: Mutex::new(HashMap::new()) }
    }

    /// Add an event to a session's buffer, creating the buffer on first use.
    pub async fn add_event(&self, session_id: &str, event: StreamEvent) {
        let mut buffers = self.buffers.lock().await;
        buffers
            .entry(session_id.to_string())
            .or_insert_with(|| ReplayBuffer::new(self.buffer_size))
            .add(event);
    }

    /// Events after the given ID for a session; empty when the session has
    /// no buffer or the ID is unknown.
    pub async fn events_after(&self, session_id: &str, last_event_id: &str) -> Vec<StreamEvent> {
        let buffers = self.buffers.lock().await;
        buffers
            .get(session_id)
            .map(|buffer| buffer.events_after(last_event_id))
            .unwrap_or_default()
    }

    /// Drop a session's buffer entirely, returning how many events it held.
    pub async fn clear_session(&self, session_id: &str) -> usize {
        let mut buffers = self.buffers.lock().await;
        buffers
            .remove(session_id)
            .map(|mut buffer| buffer.clear())
            .unwrap_or_default()
    }

    /// Number of sessions with an active buffer.
    pub async fn session_count(&self) -> usize {
        self.buffers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;

    fn event(message: &str) -> StreamEvent {
        StreamEvent::new(EventType::StepProgress, "s1", message)
    }

    #[test]
    fn test_retains_most_recent_in_order() {
        let mut buffer = ReplayBuffer::new(3);
        let events: Vec<_> = (0..5).map(|n| event(&format!("e{n}"))).collect();
        for e in &events {
            buffer.add(e.clone());
        }

        assert_eq!(buffer.len(), 3);
        let all = buffer.events_after(&events[1].event_id);
        let messages: Vec<_> = all.iter().map(|e| e.message.as_str()).collect();
        // e1 was evicted, so its id yields nothing; e2 is still indexed.
        assert!(messages.is_empty());

        let after_e2 = buffer.events_after(&events[2].event_id);
        let messages: Vec<_> = after_e2.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["e3", "e4"]);
    }

    #[test]
    fn test_events_after_exact_suffix() {
        let mut buffer = ReplayBuffer::new(10);
        let events: Vec<_> = (0..6).map(|n| event(&format!("e{n}"))).collect();
        for e in &events {
            buffer.add(e.clone());
        }

        for (k, pivot) in events.iter().enumerate() {
            let replayed = buffer.events_after(&pivot.event_id);
            let expected: Vec<_> =
                events[k + 1..].iter().map(|e| e.message.as_str()).collect();
            let got: Vec<_> = replayed.iter().map(|e| e.message.as_str()).collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn test_unknown_id_yields_empty() {
        let mut buffer = ReplayBuffer::new(4);
        buffer.add(event("e0"));
        assert!(buffer.events_after("no-such-id").is_empty());
    }

    #[test]
    fn test_latest_event_id() {
        let mut buffer = ReplayBuffer::new(4);
        assert!(buffer.latest_event_id().is_none());

        let last = event("tail");
        buffer.add(event("head"));
        buffer.add(last.clone());
        assert_eq!(buffer.latest_event_id(), Some(last.event_id.as_str()));
    }

    #[test]
    fn test_positions_survive_clear() {
        let mut buffer = ReplayBuffer::new(4);
        let before = event("before");
        buffer.add(before.clone());
        assert_eq!(buffer.clear(), 1);
        assert!(buffer.is_empty());

        let after = event("after");
        buffer.add(after.clone());
        // The pre-clear id must not alias anything buffered afterwards.
        assert!(buffer.events_after(&before.event_id).is_empty());
        assert_eq!(buffer.events_after(&after.event_id).len(), 0);
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_session_buffers_isolation() {
        let buffers = SessionBuffers::new(10);
        let a = StreamEvent::new(EventType::StepProgress, "a", "for-a");
        let b = StreamEvent::new(EventType::StepProgress, "b", "for-b");
        let b2 = StreamEvent::new(EventType::StepProgress, "b", "for-b-2");

        buffers.add_event("a", a.clone()).await;
        buffers.add_event("b", b.clone()).await;
        buffers.add_event("b", b2.clone()).await;

        assert_eq!(buffers.session_count().await, 2);
        let replayed = buffers.events_after("b", &b.event_id).await;
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].message, "for-b-2");

        // Session a's ids mean nothing to session b.
        assert!(buffers.events_after("b", &a.event_id).await.is_empty());

        assert_eq!(buffers.clear_session("b").await, 2);
        assert_eq!(buffers.session_count().await, 1);
    }
}
