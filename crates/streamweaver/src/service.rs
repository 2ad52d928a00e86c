//! Public facade tying the stream engine, session store, and metrics
//! together.
//!
//! Producers register a session, publish typed events, and eventually close
//! the stream; subscribers obtain the session's output sequence, optionally
//! resuming from a `Last-Event-ID` and projecting through a filter.

use std::sync::Arc;

use futures::Stream;
use serde_json::{Map, Value};

use crate::config::StreamConfig;
use crate::engine::{EventCallback, QueueStats, StreamEngine};
use crate::error::{StreamError, StreamResult};
use crate::events::{EventType, StreamEvent};
use crate::filters::EventFilter;
use crate::metrics::StreamMetrics;
use crate::session::{InMemorySessionStore, SessionData, SessionStatus, SessionStore, SessionUpdate};

/// Main streaming service for agentic workflows.
pub struct StreamWeaver {
    config: StreamConfig,
    store: Arc<dyn SessionStore>,
    engine: Arc<StreamEngine>,
    metrics: Option<Arc<StreamMetrics>>,
    // Kept separately so the facade can drive the sweeper lifecycle.
    memory_store: Option<Arc<InMemorySessionStore>>,
}

impl StreamWeaver {
    /// Create a service backed by the in-memory session store.
    #[must_use]
    pub fn new(config: StreamConfig) -> Self {
        let memory_store = Arc::new(InMemorySessionStore::new(
            config.session_timeout,
            config.cleanup_interval,
        ));
        let store: Arc<dyn SessionStore> = memory_store.clone();
        Self::build(config, store, Some(memory_store))
    }

    /// Create a service over a custom session store backend.
    ///
    /// The backend owns its own expiry; no sweeper is started for it.
    #[must_use]
    pub fn with_store(config: StreamConfig, store: Arc<dyn SessionStore>) -> Self {
        Self::build(config, store, None)
    }

    fn build(
        config: StreamConfig,
        store: Arc<dyn SessionStore>,
        memory_store: Option<Arc<InMemorySessionStore>>,
    ) -> Self {
        let engine = Arc::new(StreamEngine::new(Arc::clone(&store), config.clone()));
        let metrics = config
            .enable_metrics
            .then(|| Arc::new(StreamMetrics::new(config.metrics_prefix.clone())));
        Self { config, store, engine, metrics, memory_store }
    }

    /// Start background work (the idle-session sweeper). Idempotent.
    pub async fn initialize(&self) {
        if let Some(store) = &self.memory_store {
            Arc::clone(store).start_sweeper().await;
        }
        tracing::info!("streamweaver initialized");
    }

    /// Service configuration.
    #[must_use]
    pub const fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Metrics registry, when enabled.
    #[must_use]
    pub fn metrics(&self) -> Option<&Arc<StreamMetrics>> {
        self.metrics.as_ref()
    }

    /// Register a new session, overwriting any existing record with the
    /// same ID.
    pub async fn register_session(
        &self,
        session_id: &str,
        user_request: &str,
        context: Option<Map<String, Value>>,
        user_id: Option<String>,
    ) -> SessionData {
        let session = self
            .store
            .create_session(session_id, user_request, context.unwrap_or_default(), user_id)
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.record_session_created();
        }
        session
    }

    /// Look up session data.
    pub async fn get_session(&self, session_id: &str) -> Option<SessionData> {
        self.store.get_session(session_id).await
    }

    /// Apply a partial update to a session.
    ///
    /// Soft no-op returning `false` when the session does not exist.
    pub async fn update_session(&self, session_id: &str, update: SessionUpdate) -> bool {
        self.store.update_session(session_id, update).await
    }

    /// Publish an event with default fields.
    ///
    /// Returns `false` when backpressure dropped the event.
    pub async fn publish(
        &self,
        session_id: &str,
        event_type: impl Into<EventType>,
        message: impl Into<String>,
    ) -> bool {
        self.publish_event(StreamEvent::new(event_type, session_id, message)).await
    }

    /// Publish a fully built event to its session.
    ///
    /// Returns `false` when backpressure dropped the event.
    pub async fn publish_event(&self, event: StreamEvent) -> bool {
        let session_id = event.session_id.clone();
        let accepted = self.engine.publish_event(&session_id, event).await;

        if let Some(metrics) = &self.metrics {
            if accepted {
                metrics.record_event_published();
            } else {
                metrics.record_event_dropped();
            }
        }
        accepted
    }

    /// Register a callback invoked for every event published to a session.
    pub async fn register_event_callback(&self, session_id: &str, callback: Option<EventCallback>) {
        self.engine.register_event_callback(session_id, callback).await;
    }

    /// Subscribe to a session's output sequence.
    ///
    /// # Errors
    ///
    /// Fails with [`StreamError::SessionNotFound`] for an unknown session.
    pub async fn subscribe(
        &self,
        session_id: &str,
        last_event_id: Option<String>,
        filter: Option<EventFilter>,
    ) -> StreamResult<impl Stream<Item = String> + Send + 'static> {
        if self.store.get_session(session_id).await.is_none() {
            return Err(StreamError::session_not_found(session_id));
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_stream_connected(last_event_id.is_some());
        }

        Ok(Arc::clone(&self.engine).stream(session_id, last_event_id, filter))
    }

    /// Whether capacity remains for another stream.
    pub async fn check_capacity(&self) -> bool {
        let active = self.store.active_count().await;
        active < self.config.max_concurrent_streams
    }

    /// Close a stream and release every per-session resource. Idempotent.
    pub async fn close_stream(&self, session_id: &str, reason: Option<&str>) -> bool {
        let reason = reason.unwrap_or("Stream closed");
        tracing::info!(session_id = %session_id, reason, "closing stream");

        self.engine.cancel_stream(session_id).await;
        self.store
            .update_session(
                session_id,
                SessionUpdate::default().with_status(SessionStatus::Completed),
            )
            .await;
        self.store.delete_session(session_id).await;
        self.engine.cleanup_queue(session_id).await;
        self.engine.register_event_callback(session_id, None).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_session_closed();
            metrics.record_stream_disconnected();
        }
        true
    }

    /// Buffered events strictly newer than `last_event_id`.
    pub async fn get_replay_events(
        &self,
        session_id: &str,
        last_event_id: &str,
    ) -> Vec<StreamEvent> {
        let events = self.engine.get_replay_events(session_id, last_event_id).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_replay(events.len() as u64);
        }
        events
    }

    /// Queue statistics for a session.
    pub async fn queue_stats(&self, session_id: &str) -> QueueStats {
        self.engine.queue_stats(session_id).await
    }

    /// Tear down background work and cancel outstanding subscribers.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down streamweaver");
        self.engine.shutdown().await;
        if let Some(store) = &self.memory_store {
            store.close().await;
        }
    }
}

impl std::fmt::Debug for StreamWeaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWeaver")
            .field("config", &self.config)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_get_session() {
        let weaver = StreamWeaver::new(StreamConfig::default());
        weaver.initialize().await;

        let mut context = Map::new();
        context.insert("key".to_string(), Value::String("value".to_string()));
        weaver
            .register_session("s1", "hello world", Some(context.clone()), Some("u1".to_string()))
            .await;

        let session = weaver.get_session("s1").await.expect("session");
        assert_eq!(session.session_id, "s1");
        assert_eq!(session.user_request, "hello world");
        assert_eq!(session.context, context);
        assert_eq!(session.user_id.as_deref(), Some("u1"));

        weaver.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_twice_keeps_second() {
        let weaver = StreamWeaver::new(StreamConfig::default());
        weaver.register_session("s1", "first", None, None).await;
        weaver.register_session("s1", "second", None, None).await;

        let session = weaver.get_session("s1").await.expect("session");
        assert_eq!(session.user_request, "second");
    }

    #[tokio::test]
    async fn test_publish_touches_session() {
        let weaver = StreamWeaver::new(StreamConfig::default());
        weaver.register_session("s1", "req", None, None).await;

        assert!(weaver.publish("s1", EventType::WorkflowStarted, "starting").await);

        let session = weaver.get_session("s1").await.expect("session");
        assert_eq!(session.current_step.as_deref(), Some("starting"));
    }

    #[tokio::test]
    async fn test_subscribe_unknown_session_fails() {
        let weaver = StreamWeaver::new(StreamConfig::default());
        let result = weaver.subscribe("ghost", None, None).await;
        assert!(matches!(result, Err(StreamError::SessionNotFound { .. })));
    }

    #[tokio::test]
    async fn test_check_capacity() {
        let config = StreamConfig { max_concurrent_streams: 2, ..StreamConfig::default() };
        let weaver = StreamWeaver::new(config);

        assert!(weaver.check_capacity().await);
        weaver.register_session("s1", "req", None, None).await;
        assert!(weaver.check_capacity().await);
        weaver.register_session("s2", "req", None, None).await;
        assert!(!weaver.check_capacity().await);
    }

    #[tokio::test]
    async fn test_close_stream_is_idempotent() {
        let weaver = StreamWeaver::new(StreamConfig::default());
        weaver.register_session("s1", "req", None, None).await;
        weaver.publish("s1", EventType::StepStarted, "step").await;

        assert!(weaver.close_stream("s1", Some("test done")).await);
        assert!(weaver.get_session("s1").await.is_none());
        assert!(!weaver.queue_stats("s1").await.exists);

        // Second close is a no-op but still succeeds.
        assert!(weaver.close_stream("s1", None).await);
    }

    #[tokio::test]
    async fn test_metrics_record_lifecycle() {
        let config = StreamConfig { enable_metrics: true, ..StreamConfig::default() };
        let weaver = StreamWeaver::new(config);
        weaver.register_session("s1", "req", None, None).await;
        weaver.publish("s1", EventType::StepStarted, "step").await;
        weaver.close_stream("s1", None).await;

        let rendered = weaver.metrics().expect("metrics").render();
        assert!(rendered.contains("streamweaver_sessions_created_total 1"));
        assert!(rendered.contains("streamweaver_events_published_total 1"));
        assert!(rendered.contains("streamweaver_sessions_closed_total 1"));
    }
}
