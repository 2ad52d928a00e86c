//! StreamWeaver
//!
//! Session-scoped event-streaming middleware for long-running agentic
//! workflows: producers publish typed progress events tagged with a session
//! ID, and clients subscribe over SSE or WebSockets.
//!
//! # Features
//!
//! - **Ordered delivery**: per-session FIFO with bounded queues and
//!   pluggable overflow policies
//! - **Replay**: ring-buffered events keyed by ID for transparent
//!   reconnection via `Last-Event-ID`
//! - **Projection**: composable visibility/type/session filters applied at
//!   the subscriber boundary
//! - **Batching**: bursty events coalesced under size/time bounds, with
//!   immediate delivery for terminal classes
//! - **Async-first**: built on Tokio; one subscriber, one heartbeat task,
//!   and one sweeper per process
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamweaver::{EventType, StreamConfig, StreamWeaver};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let weaver = Arc::new(StreamWeaver::new(StreamConfig::default()));
//!     weaver.initialize().await;
//!
//!     weaver.register_session("run-1", "summarize the report", None, None).await;
//!     weaver.publish("run-1", EventType::WorkflowStarted, "Starting").await;
//!
//!     let mut stream = weaver.subscribe("run-1", None, None).await?;
//!     // Serve `stream` over SSE, or poll it directly.
//!     # let _ = &mut stream;
//!     Ok(())
//! }
//! ```

pub mod batching;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod filters;
pub mod metrics;
pub mod queue;
pub mod replay;
pub mod session;
pub mod service;
pub mod transport;

pub use batching::{BatchConfig, EventBatcher};
pub use config::StreamConfig;
pub use engine::{EventCallback, QueueStats, StreamEngine};
pub use error::{RecvTimeout, StreamError, StreamResult};
pub use events::{EventType, EventVisibility, StreamEvent};
pub use filters::EventFilter;
pub use metrics::StreamMetrics;
pub use queue::{BoundedQueue, OverflowPolicy};
pub use replay::ReplayBuffer;
pub use service::StreamWeaver;
pub use session::{InMemorySessionStore, SessionData, SessionStatus, SessionStore, SessionUpdate};
