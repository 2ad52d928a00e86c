//! Stream metrics with Prometheus text exposition.
//!
//! Counters and gauges are plain atomics; `render` produces the text format
//! served by the `/metrics` endpoint.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Metrics for event publishing, sessions, streams, and replay.
#[derive(Debug)]
pub struct StreamMetrics {
    prefix: String,
    events_published: AtomicU64,
    events_dropped: AtomicU64,
    sessions_created: AtomicU64,
    sessions_closed: AtomicU64,
    active_sessions: AtomicI64,
    active_streams: AtomicI64,
    connections_initial: AtomicU64,
    connections_reconnect: AtomicU64,
    disconnections: AtomicU64,
    replay_requests: AtomicU64,
    events_replayed: AtomicU64,
    errors: AtomicU64,
}

impl StreamMetrics {
    /// Create a metrics registry whose exposed names use `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            events_published: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            active_sessions: AtomicI64::new(0),
            active_streams: AtomicI64::new(0),
            connections_initial: AtomicU64::new(0),
            connections_reconnect: AtomicU64::new(0),
            disconnections: AtomicU64::new(0),
            replay_requests: AtomicU64::new(0),
            events_replayed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Record that an event was published.
    pub fn record_event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that an event was dropped due to backpressure.
    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a session was created.
    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a session was closed.
    pub fn record_session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a stream connection, labeled by whether it is a reconnection.
    pub fn record_stream_connected(&self, reconnection: bool) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
        if reconnection {
            self.connections_reconnect.fetch_add(1, Ordering::Relaxed);
        } else {
            self.connections_initial.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a stream disconnection.
    pub fn record_stream_disconnected(&self) {
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
        self.disconnections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a replay request and how many events it served.
    pub fn record_replay(&self, event_count: u64) {
        self.replay_requests.fetch_add(1, Ordering::Relaxed);
        self.events_replayed.fetch_add(event_count, Ordering::Relaxed);
    }

    /// Record an internal error.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Render all metrics in Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        let prefix = &self.prefix;

        let counters: [(&str, &str, u64); 7] = [
            (
                "events_published_total",
                "Total number of events published",
                self.events_published.load(Ordering::Relaxed),
            ),
            (
                "events_dropped_total",
                "Total number of events dropped due to backpressure",
                self.events_dropped.load(Ordering::Relaxed),
            ),
            (
                "sessions_created_total",
                "Total number of sessions created",
                self.sessions_created.load(Ordering::Relaxed),
            ),
            (
                "sessions_closed_total",
                "Total number of sessions closed",
                self.sessions_closed.load(Ordering::Relaxed),
            ),
            (
                "stream_disconnections_total",
                "Total number of stream disconnections",
                self.disconnections.load(Ordering::Relaxed),
            ),
            (
                "replay_requests_total",
                "Total number of replay requests",
                self.replay_requests.load(Ordering::Relaxed),
            ),
            (
                "events_replayed_total",
                "Total number of events replayed",
                self.events_replayed.load(Ordering::Relaxed),
            ),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {prefix}_{name} {help}");
            let _ = writeln!(out, "# TYPE {prefix}_{name} counter");
            let _ = writeln!(out, "{prefix}_{name} {value}");
        }

        let _ = writeln!(
            out,
            "# HELP {prefix}_stream_connections_total Total number of stream connections"
        );
        let _ = writeln!(out, "# TYPE {prefix}_stream_connections_total counter");
        let _ = writeln!(
            out,
            "{prefix}_stream_connections_total{{reconnection=\"false\"}} {}",
            self.connections_initial.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "{prefix}_stream_connections_total{{reconnection=\"true\"}} {}",
            self.connections_reconnect.load(Ordering::Relaxed)
        );

        let _ = writeln!(out, "# HELP {prefix}_errors_total Total number of errors");
        let _ = writeln!(out, "# TYPE {prefix}_errors_total counter");
        let _ = writeln!(out, "{prefix}_errors_total {}", self.errors.load(Ordering::Relaxed));

        let gauges: [(&str, &str, i64); 2] = [
            (
                "active_sessions",
                "Number of currently active sessions",
                self.active_sessions.load(Ordering::Relaxed),
            ),
            (
                "active_streams",
                "Number of currently active streams",
                self.active_streams.load(Ordering::Relaxed),
            ),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {prefix}_{name} {help}");
            let _ = writeln!(out, "# TYPE {prefix}_{name} gauge");
            let _ = writeln!(out, "{prefix}_{name} {value}");
        }

        out
    }
}
