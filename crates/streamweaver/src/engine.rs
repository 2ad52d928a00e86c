//! Stream engine: fuses replay, live drain, heartbeats, and filters into a
//! single per-session output sequence.
//!
//! Heartbeats are enqueued in-band through the same queue as normal events,
//! so the subscriber loop has exactly one source to drain. Visibility
//! projection happens at delivery, never at publish, which keeps replay
//! correct across subscribers with different filters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::batching::{BatchSink, EventBatcher};
use crate::config::StreamConfig;
use crate::events::{EventType, EventVisibility, StreamEvent};
use crate::filters::EventFilter;
use crate::queue::BoundedQueue;
use crate::replay::SessionBuffers;
use crate::session::{SessionStore, SessionUpdate};

/// How long a drain waits before re-checking for cancellation.
const RECV_TIMEOUT: Duration = Duration::from_secs(15);

/// Queue depth above which heartbeats are suppressed.
const HEARTBEAT_SUPPRESS_DEPTH: usize = 5;

/// Message attached to the supersede sentinel.
const SUPERSEDED_MESSAGE: &str = "Stream has been superseded by a new connection";

/// Per-session callback invoked synchronously before an event is enqueued.
///
/// Failures are logged and never abort the publish.
pub type EventCallback = Arc<dyn Fn(&StreamEvent) -> anyhow::Result<()> + Send + Sync>;

/// Queue statistics for a session.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub exists: bool,
    pub size: usize,
    pub max_size: usize,
    pub dropped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full: Option<bool>,
}

struct SubscriberHandle {
    cancel: Arc<Notify>,
}

/// Binds queues, replay buffers, heartbeats, and filters into per-session
/// output sequences.
pub struct StreamEngine {
    store: Arc<dyn SessionStore>,
    config: StreamConfig,
    queues: Mutex<HashMap<String, Arc<BoundedQueue>>>,
    subscribers: Mutex<HashMap<String, SubscriberHandle>>,
    callbacks: Mutex<HashMap<String, EventCallback>>,
    buffers: SessionBuffers,
}

impl StreamEngine {
    /// Create an engine over the given session store.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, config: StreamConfig) -> Self {
        let buffers = SessionBuffers::new(config.event_buffer_size);
        Self {
            store,
            config,
            queues: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            buffers,
        }
    }

    /// Register or clear the event callback for a session.
    pub async fn register_event_callback(&self, session_id: &str, callback: Option<EventCallback>) {
        let mut callbacks = self.callbacks.lock().await;
        match callback {
            Some(callback) => {
                callbacks.insert(session_id.to_string(), callback);
                tracing::debug!(session_id = %session_id, "registered event callback");
            }
            None => {
                if callbacks.remove(session_id).is_some() {
                    tracing::debug!(session_id = %session_id, "unregistered event callback");
                }
            }
        }
    }

    /// Publish an event to a session.
    ///
    /// The event is buffered for replay, handed to the registered callback,
    /// and enqueued; on acceptance the session's `last_activity` and
    /// `current_step` are refreshed. Returns `false` when backpressure
    /// dropped the event.
    pub async fn publish_event(&self, session_id: &str, event: StreamEvent) -> bool {
        if self.config.enable_replay {
            self.buffers.add_event(session_id, event.clone()).await;
        }

        let callback = { self.callbacks.lock().await.get(session_id).cloned() };
        if let Some(callback) = callback {
            if let Err(error) = callback(&event) {
                tracing::error!(session_id = %session_id, %error, "event callback failed");
            }
        }

        let queue = self.ensure_queue(session_id).await;
        let current_step = event.message.clone();
        let accepted = queue.put(event).await;
        if accepted {
            self.store
                .update_session(
                    session_id,
                    SessionUpdate::default().with_current_step(current_step),
                )
                .await;
        } else {
            tracing::warn!(session_id = %session_id, "event dropped due to backpressure");
        }
        accepted
    }

    /// Get or create the event queue for a session.
    pub async fn ensure_queue(&self, session_id: &str) -> Arc<BoundedQueue> {
        let mut queues = self.queues.lock().await;
        Arc::clone(queues.entry(session_id.to_string()).or_insert_with(|| {
            tracing::debug!(session_id = %session_id, "creating event queue");
            Arc::new(BoundedQueue::new(
                self.config.queue_size,
                self.config.backpressure_policy,
            ))
        }))
    }

    /// Produce the output sequence for one subscriber.
    ///
    /// Emits an optional replay prefix, a synthesized connect event when no
    /// replay was requested, then multiplexes queue drains and heartbeats
    /// until the terminal event or cancellation. A new subscription for a
    /// session that already has one supersedes it.
    pub fn stream(
        self: Arc<Self>,
        session_id: impl Into<String>,
        last_event_id: Option<String>,
        filter: Option<EventFilter>,
    ) -> impl Stream<Item = String> + Send + 'static {
        let engine = self;
        let session_id = session_id.into();

        stream! {
            // Reconnection: replay missed events before anything can clear
            // the buffer.
            if let Some(last_id) = last_event_id.as_deref() {
                let events = engine.buffers.events_after(&session_id, last_id).await;
                let count = events.len();
                for event in events {
                    if accepts(filter.as_ref(), &event) {
                        yield event.to_sse();
                    }
                }
                tracing::info!(session_id = %session_id, count, "replayed events");
            }

            // Supersede any subscriber that is still attached. The sentinel
            // terminates it in-band; cancellation is the fallback for a
            // queue too full to take the sentinel.
            let previous = { engine.subscribers.lock().await.remove(&session_id) };
            if let Some(previous) = previous {
                if !engine.cleanup_queue(&session_id).await {
                    previous.cancel.notify_one();
                }
                tracing::info!(session_id = %session_id, "superseded previous subscriber");
            }

            let queue = engine.ensure_queue(&session_id).await;
            let cancel = Arc::new(Notify::new());
            {
                let mut subscribers = engine.subscribers.lock().await;
                subscribers.insert(
                    session_id.clone(),
                    SubscriberHandle { cancel: Arc::clone(&cancel) },
                );
            }

            let mut guard = StreamGuard {
                engine: Arc::clone(&engine),
                session_id: session_id.clone(),
                queue: Arc::clone(&queue),
                cancel: Arc::clone(&cancel),
                heartbeat: None,
            };

            if last_event_id.is_none() {
                let connected = StreamEvent::new(
                    EventType::WorkflowStarted,
                    session_id.clone(),
                    "Connected to stream",
                );
                if accepts(filter.as_ref(), &connected) {
                    yield connected.to_sse();
                }
                tracing::info!(session_id = %session_id, "stream started");
            }

            if engine.config.enable_heartbeat {
                guard.heartbeat = Some(engine.spawn_heartbeat(&session_id, &queue));
            }

            // Timer-driven batch flushes come back to this task through a
            // channel so the subscriber stays the single writer.
            let (flush_tx, mut flush_rx) = mpsc::unbounded_channel::<String>();
            let batcher = engine.config.enable_batching.then(|| {
                let sink: BatchSink = Arc::new(move |payload| {
                    flush_tx.send(payload)?;
                    Ok(())
                });
                EventBatcher::new(session_id.clone(), engine.config.batch_config(), Some(sink))
            });

            enum Pulse {
                Cancelled,
                Flushed(String),
                Drained(StreamEvent),
                TimedOut,
            }

            loop {
                let pulse = tokio::select! {
                    () = cancel.notified() => Pulse::Cancelled,
                    Some(payload) = flush_rx.recv() => Pulse::Flushed(payload),
                    result = queue.get(Some(RECV_TIMEOUT)) => match result {
                        Ok(event) => Pulse::Drained(event),
                        Err(_) => Pulse::TimedOut,
                    },
                };

                match pulse {
                    Pulse::Cancelled => {
                        tracing::info!(session_id = %session_id, "stream cancelled");
                        break;
                    }
                    // Timeouts only exist to re-check cancellation.
                    Pulse::TimedOut => {}
                    Pulse::Flushed(payload) => yield payload,
                    Pulse::Drained(event) => {
                        // A panicking user predicate must not tear the task
                        // down without a clean end-of-stream.
                        let decision = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                            || accepts(filter.as_ref(), &event),
                        ));
                        let keep = match decision {
                            Ok(keep) => keep,
                            Err(_) => {
                                tracing::error!(session_id = %session_id, "event filter panicked");
                                yield fatal_event(&session_id, "Stream error: event filter panicked")
                                    .to_sse();
                                break;
                            }
                        };
                        if !keep {
                            continue;
                        }

                        let terminal = match event.event_type {
                            EventType::WorkflowCompleted => {
                                tracing::info!(session_id = %session_id, "workflow completed");
                                true
                            }
                            EventType::WorkflowInterruption => !event.success,
                            _ => false,
                        };

                        match &batcher {
                            Some(batcher) => match batcher.add(event).await {
                                Ok(Some(payload)) => yield payload,
                                Ok(None) => {}
                                Err(error) => {
                                    tracing::error!(session_id = %session_id, %error, "fatal stream error");
                                    yield fatal_event(
                                        &session_id,
                                        format!("Fatal stream error: {error}"),
                                    )
                                    .to_sse();
                                    break;
                                }
                            },
                            None => yield event.to_sse(),
                        }

                        if terminal {
                            break;
                        }
                    }
                }
            }

            // A terminal event deferred into the batch still has to go out.
            if let Some(batcher) = &batcher {
                match batcher.close().await {
                    Ok(Some(leftover)) => yield leftover,
                    Ok(None) => {}
                    Err(error) => {
                        tracing::debug!(session_id = %session_id, %error, "batcher close skipped");
                    }
                }
            }
        }
    }

    fn spawn_heartbeat(&self, session_id: &str, queue: &Arc<BoundedQueue>) -> JoinHandle<()> {
        let session_id = session_id.to_string();
        let queue = Arc::clone(queue);
        let interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut sequence: u64 = 0;
            loop {
                tokio::time::sleep(interval).await;

                // Self-suppress while the subscriber is backed up.
                if queue.size() > HEARTBEAT_SUPPRESS_DEPTH {
                    continue;
                }

                sequence += 1;
                let heartbeat =
                    StreamEvent::new(EventType::Heartbeat, session_id.clone(), "Heartbeat")
                        .with_visibility(EventVisibility::InternalOnly)
                        .with_data(serde_json::json!({ "sequence": sequence }));
                if !queue.put(heartbeat).await {
                    tracing::debug!(session_id = %session_id, "heartbeat dropped");
                }
            }
        })
    }

    /// Cancel the active subscriber for a session, if any.
    pub async fn cancel_stream(&self, session_id: &str) {
        let subscribers = self.subscribers.lock().await;
        if let Some(handle) = subscribers.get(session_id) {
            handle.cancel.notify_one();
        }
    }

    /// Remove a session's queue after waking any blocked reader with a
    /// terminal interruption event, then clear its replay buffer.
    ///
    /// Returns whether the sentinel was enqueued.
    pub async fn cleanup_queue(&self, session_id: &str) -> bool {
        let mut sentinel_sent = false;
        let queue = { self.queues.lock().await.remove(session_id) };
        if let Some(queue) = queue {
            if queue.is_full() {
                // A full Block-policy queue would stall us; the reader will
                // notice the removal on its next timeout.
                tracing::debug!(session_id = %session_id, "queue full, skipping interruption sentinel");
            } else {
                let sentinel =
                    StreamEvent::new(EventType::WorkflowInterruption, session_id, SUPERSEDED_MESSAGE)
                        .with_success(false);
                sentinel_sent = queue.put(sentinel).await;
            }
        }

        self.buffers.clear_session(session_id).await;
        sentinel_sent
    }

    /// Buffered events strictly newer than `last_event_id`.
    pub async fn get_replay_events(
        &self,
        session_id: &str,
        last_event_id: &str,
    ) -> Vec<StreamEvent> {
        self.buffers.events_after(session_id, last_event_id).await
    }

    /// Queue statistics for a session.
    pub async fn queue_stats(&self, session_id: &str) -> QueueStats {
        let queues = self.queues.lock().await;
        queues.get(session_id).map_or(
            QueueStats {
                exists: false,
                size: 0,
                max_size: self.config.queue_size,
                dropped: 0,
                full: None,
            },
            |queue| QueueStats {
                exists: true,
                size: queue.size(),
                max_size: self.config.queue_size,
                dropped: queue.dropped_count(),
                full: Some(queue.is_full()),
            },
        )
    }

    /// Cancel every outstanding subscriber and drop all callbacks.
    pub async fn shutdown(&self) {
        let subscribers = self.subscribers.lock().await;
        for handle in subscribers.values() {
            handle.cancel.notify_one();
        }
        drop(subscribers);
        self.callbacks.lock().await.clear();
    }

    async fn release_subscriber(
        &self,
        session_id: &str,
        queue: &Arc<BoundedQueue>,
        cancel: &Arc<Notify>,
    ) {
        // Queue first: a racing reconnect must never adopt a queue that is
        // about to disappear.
        {
            let mut queues = self.queues.lock().await;
            if queues.get(session_id).is_some_and(|installed| Arc::ptr_eq(installed, queue)) {
                queues.remove(session_id);
            }
        }
        {
            let mut subscribers = self.subscribers.lock().await;
            if subscribers
                .get(session_id)
                .is_some_and(|handle| Arc::ptr_eq(&handle.cancel, cancel))
            {
                subscribers.remove(session_id);
            }
        }
        tracing::debug!(session_id = %session_id, "stream closed");
    }
}

impl std::fmt::Debug for StreamEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEngine")
            .field("queue_size", &self.config.queue_size)
            .field("backpressure_policy", &self.config.backpressure_policy)
            .finish()
    }
}

/// Releases subscriber resources whether the stream completes or its
/// consumer is dropped mid-flight (client disconnect).
struct StreamGuard {
    engine: Arc<StreamEngine>,
    session_id: String,
    queue: Arc<BoundedQueue>,
    cancel: Arc<Notify>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }

        let engine = Arc::clone(&self.engine);
        let session_id = std::mem::take(&mut self.session_id);
        let queue = Arc::clone(&self.queue);
        let cancel = Arc::clone(&self.cancel);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                engine.release_subscriber(&session_id, &queue, &cancel).await;
            });
        }
    }
}

fn accepts(filter: Option<&EventFilter>, event: &StreamEvent) -> bool {
    filter.map_or(true, |filter| filter.matches(event))
}

/// Synthesized terminal `error` event for an unexpected stream-loop fault.
fn fatal_event(session_id: &str, message: impl Into<String>) -> StreamEvent {
    StreamEvent::new(EventType::Error, session_id, message).with_success(false)
}
