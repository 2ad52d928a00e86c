//! Burst coalescing for high-frequency events.
//!
//! Bursty producers (token chunks, step progress) are coalesced into one
//! framed payload bounded by a size limit and a delay; terminal and error
//! classes bypass the batch and flush whatever is pending ahead of
//! themselves. Events leave a batcher in the order they entered, and a
//! batcher never mixes sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{StreamError, StreamResult};
use crate::events::{EventType, StreamEvent};

/// Sink invoked with the payload of a timer-driven flush.
///
/// Failures are logged and dropped; they never propagate to producers.
pub type BatchSink = Arc<dyn Fn(String) -> anyhow::Result<()> + Send + Sync>;

/// Configuration for event batching.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Whether batching is active at all.
    pub enabled: bool,
    /// Flush once this many events are pending.
    pub max_batch_size: usize,
    /// Flush once the oldest pending event is this old.
    pub max_batch_delay: Duration,
    /// Event types that are never batched.
    pub immediate_types: Vec<EventType>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_batch_size: 10,
            max_batch_delay: Duration::from_millis(50),
            immediate_types: vec![
                EventType::WorkflowCompleted,
                EventType::Error,
                EventType::WorkflowInterruption,
            ],
        }
    }
}

#[derive(Debug)]
struct BatchState {
    pending: Vec<StreamEvent>,
    // At most one armed timer; re-arming aborts the previous one first.
    flush_task: Option<JoinHandle<()>>,
    closed: bool,
}

struct BatcherInner {
    session_id: String,
    config: BatchConfig,
    state: Mutex<BatchState>,
    on_batch_ready: Option<BatchSink>,
}

impl BatcherInner {
    /// Drain the pending batch into a wire payload, disarming the timer.
    async fn flush(&self) -> Option<String> {
        let events = {
            let mut state = self.state.lock().await;
            if let Some(task) = state.flush_task.take() {
                // The timer may be the caller; a task must not abort itself.
                if tokio::task::try_id() != Some(task.id()) {
                    task.abort();
                }
            }
            if state.pending.is_empty() {
                return None;
            }
            std::mem::take(&mut state.pending)
        };
        Some(format_batch(&events))
    }

    fn arm_timer(inner: &Arc<Self>, state: &mut BatchState) {
        if let Some(task) = state.flush_task.take() {
            task.abort();
        }
        let inner = Arc::clone(inner);
        state.flush_task = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.config.max_batch_delay).await;
            if let Some(payload) = inner.flush().await {
                if let Some(sink) = &inner.on_batch_ready {
                    if let Err(error) = sink(payload) {
                        tracing::error!(
                            session_id = %inner.session_id,
                            %error,
                            "batch flush sink failed"
                        );
                    }
                }
            }
        }));
    }
}

/// Coalesces a single session's events for efficient delivery.
///
/// A batch is emitted when it reaches `max_batch_size`, when its delay
/// expires (handed to the registered sink), or when an immediate-type event
/// arrives (flushed inline ahead of that event).
#[derive(Clone)]
pub struct EventBatcher {
    inner: Arc<BatcherInner>,
}

impl EventBatcher {
    /// Create a batcher for one session.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        config: BatchConfig,
        on_batch_ready: Option<BatchSink>,
    ) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                session_id: session_id.into(),
                config,
                state: Mutex::new(BatchState {
                    pending: Vec::new(),
                    flush_task: None,
                    closed: false,
                }),
                on_batch_ready,
            }),
        }
    }

    /// Add an event.
    ///
    /// Returns `Ok(None)` when the event was deferred into the batch, or a
    /// wire payload when something must be delivered now: a full batch, or
    /// a flushed batch followed by an immediate event.
    ///
    /// # Errors
    ///
    /// Fails with [`StreamError::BatcherClosed`] once the batcher is
    /// closed; the event is not queued.
    pub async fn add(&self, event: StreamEvent) -> StreamResult<Option<String>> {
        if !self.inner.config.enabled
            || self.inner.config.immediate_types.contains(&event.event_type)
        {
            {
                let state = self.inner.state.lock().await;
                if state.closed {
                    return Err(StreamError::BatcherClosed);
                }
            }
            let mut payload = self.inner.flush().await.unwrap_or_default();
            payload.push_str(&event.to_sse());
            return Ok(Some(payload));
        }

        let should_flush = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(StreamError::BatcherClosed);
            }
            state.pending.push(event);
            if state.pending.len() == 1 {
                BatcherInner::arm_timer(&self.inner, &mut state);
            }
            state.pending.len() >= self.inner.config.max_batch_size
        };

        // Flush outside the lock so the timer path never deadlocks with us.
        if should_flush {
            return Ok(self.inner.flush().await);
        }
        Ok(None)
    }

    /// Force an immediate flush of the pending batch.
    pub async fn flush(&self) -> Option<String> {
        self.inner.flush().await
    }

    /// Flush remaining events and refuse further `add` calls.
    ///
    /// # Errors
    ///
    /// Fails with [`StreamError::BatcherClosed`] when already closed.
    pub async fn close(&self) -> StreamResult<Option<String>> {
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(StreamError::BatcherClosed);
            }
            state.closed = true;
            if let Some(task) = state.flush_task.take() {
                task.abort();
            }
        }
        Ok(self.inner.flush().await)
    }

    /// Number of events currently pending.
    pub async fn pending_len(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    /// Session this batcher belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }
}

/// Format a drained batch as a single SSE payload.
///
/// One event keeps the per-event `message` channel; several become one
/// `batch` payload whose `data` is a JSON array and whose `id` is the last
/// event's.
fn format_batch(events: &[StreamEvent]) -> String {
    if let [only] = events {
        return only.to_sse();
    }

    let body: Vec<_> = events.iter().map(StreamEvent::to_json).collect();
    let last_id = events.last().map(|event| event.event_id.as_str()).unwrap_or_default();
    format!(
        "id: {last_id}\nevent: batch\ndata: {}\n\n",
        serde_json::Value::Array(body)
    )
}
