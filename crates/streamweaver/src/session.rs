//! Session metadata and storage backends.
//!
//! A session is the logical unit of one workflow run. The [`SessionStore`]
//! trait is the seam for remote backends; the in-memory reference
//! implementation covers development and single-process deployments and
//! sweeps idle sessions on a fixed interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::events::unix_now;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Wire value of this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Data stored for a workflow session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub session_id: String,
    pub user_request: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: f64,
    pub last_activity: f64,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub total_steps: u32,
    #[serde(default)]
    pub completed_steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
}

impl SessionData {
    /// Create a session stamped with the current time.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        user_request: impl Into<String>,
        context: Map<String, Value>,
        user_id: Option<String>,
    ) -> Self {
        let now = unix_now();
        Self {
            session_id: session_id.into(),
            user_request: user_request.into(),
            context,
            user_id,
            created_at: now,
            last_activity: now,
            status: SessionStatus::default(),
            total_steps: 0,
            completed_steps: 0,
            current_step: None,
        }
    }
}

/// Partial update applied by [`SessionStore::update_session`].
///
/// `last_activity` is always refreshed to the current time by the store, so
/// it is not part of the update shape.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub total_steps: Option<u32>,
    pub completed_steps: Option<u32>,
    pub current_step: Option<String>,
    pub context: Option<Map<String, Value>>,
}

impl SessionUpdate {
    /// Set the lifecycle status.
    #[must_use]
    pub const fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the step counters.
    #[must_use]
    pub const fn with_progress(mut self, completed_steps: u32, total_steps: u32) -> Self {
        self.completed_steps = Some(completed_steps);
        self.total_steps = Some(total_steps);
        self
    }

    /// Set the human-readable current step.
    #[must_use]
    pub fn with_current_step(mut self, current_step: impl Into<String>) -> Self {
        self.current_step = Some(current_step.into());
        self
    }

    /// Replace the session context.
    #[must_use]
    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = Some(context);
        self
    }
}

/// Abstract session storage backend.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session, overwriting any existing record with the same ID.
    async fn create_session(
        &self,
        session_id: &str,
        user_request: &str,
        context: Map<String, Value>,
        user_id: Option<String>,
    ) -> SessionData;

    /// Look up a session by ID.
    async fn get_session(&self, session_id: &str) -> Option<SessionData>;

    /// Apply a partial update and refresh `last_activity`.
    ///
    /// Returns `false` when the session does not exist (soft no-op).
    async fn update_session(&self, session_id: &str, update: SessionUpdate) -> bool;

    /// Delete a session. Returns whether it existed.
    async fn delete_session(&self, session_id: &str) -> bool;

    /// Count of sessions currently stored.
    async fn active_count(&self) -> usize;

    /// Extend a session's TTL. Backends without native expiry may decline.
    async fn extend_session(&self, _session_id: &str, _seconds: u64) -> bool {
        false
    }
}

/// In-memory session storage for development and testing.
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, SessionData>>,
    session_timeout: Duration,
    cleanup_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl InMemorySessionStore {
    /// Create a store that expires sessions idle longer than
    /// `session_timeout`, checked every `cleanup_interval`.
    #[must_use]
    pub fn new(session_timeout: Duration, cleanup_interval: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            session_timeout,
            cleanup_interval,
            sweeper: Mutex::new(None),
        }
    }

    /// Start the background sweeper. Idempotent.
    pub async fn start_sweeper(self: Arc<Self>) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let store = Arc::clone(&self);
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.cleanup_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.sweep_expired().await;
                if removed > 0 {
                    tracing::info!(count = removed, "cleaned up expired sessions");
                }
            }
        }));
        tracing::info!("in-memory session store initialized");
    }

    /// Delete every session idle beyond the timeout, returning the count.
    pub async fn sweep_expired(&self) -> usize {
        let cutoff = self.session_timeout.as_secs_f64();
        let now = unix_now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| now - session.last_activity <= cutoff);
        before - sessions.len()
    }

    /// Stop the background sweeper.
    pub async fn close(&self) {
        if let Some(task) = self.sweeper.lock().await.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(
        &self,
        session_id: &str,
        user_request: &str,
        context: Map<String, Value>,
        user_id: Option<String>,
    ) -> SessionData {
        let session = SessionData::new(session_id, user_request, context, user_id);
        let mut sessions = self.sessions.write().await;
        if sessions.insert(session_id.to_string(), session.clone()).is_some() {
            tracing::warn!(session_id = %session_id, "session already exists, overwriting");
        } else {
            tracing::info!(session_id = %session_id, "created session");
        }
        session
    }

    async fn get_session(&self, session_id: &str) -> Option<SessionData> {
        self.sessions.read().await.get(session_id).cloned()
    }

    async fn update_session(&self, session_id: &str, update: SessionUpdate) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            tracing::debug!(session_id = %session_id, "session not found for update");
            return false;
        };

        if let Some(status) = update.status {
            session.status = status;
        }
        if let Some(total_steps) = update.total_steps {
            session.total_steps = total_steps;
        }
        if let Some(completed_steps) = update.completed_steps {
            session.completed_steps = completed_steps;
        }
        if let Some(current_step) = update.current_step {
            session.current_step = Some(current_step);
        }
        if let Some(context) = update.context {
            session.context = context;
        }
        session.last_activity = unix_now();
        true
    }

    async fn delete_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        if removed {
            tracing::info!(session_id = %session_id, "deleted session");
        }
        removed
    }

    async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl std::fmt::Debug for InMemorySessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySessionStore")
            .field("session_timeout", &self.session_timeout)
            .field("cleanup_interval", &self.cleanup_interval)
            .finish()
    }
}
