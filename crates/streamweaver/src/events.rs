//! Streaming event types and their SSE wire form.
//!
//! Events are immutable once published: producers build a [`StreamEvent`],
//! hand it to the service, and never touch it again. The wire form carries
//! an `id:` line so clients can resume with `Last-Event-ID`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Audience tag controlling downstream projection of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventVisibility {
    /// For the user's chat UI and the model's conversation history.
    #[default]
    UserFacing,
    /// For the model's persistent memory, not the user chat UI.
    ModelOnly,
    /// For the real-time UI stream only (e.g. reasoning tokens).
    LiveUiOnly,
    /// For server logs and debugging. Not for UI or model.
    InternalOnly,
}

impl EventVisibility {
    /// Wire value of this visibility level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UserFacing => "user_facing",
            Self::ModelOnly => "model_only",
            Self::LiveUiOnly => "live_ui_only",
            Self::InternalOnly => "internal_only",
        }
    }
}

impl From<String> for EventVisibility {
    fn from(value: String) -> Self {
        match value.as_str() {
            "model_only" => Self::ModelOnly,
            "live_ui_only" => Self::LiveUiOnly,
            "internal_only" => Self::InternalOnly,
            // Unknown labels coerce to the broadest audience.
            _ => Self::UserFacing,
        }
    }
}

impl From<EventVisibility> for String {
    fn from(value: EventVisibility) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EventVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of a streaming event in an agentic workflow.
///
/// The enumeration is closed on the wire but forward compatible: unknown
/// string values deserialize to [`EventType::Other`] and round-trip
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    WorkflowStarted,
    WorkflowCompleted,
    StepStarted,
    StepProgress,
    StepCompleted,
    StepFailed,
    ToolExecuted,
    ToolCompleted,
    Error,
    Heartbeat,
    AgentMessage,
    TokenChunk,
    WorkflowInterruption,
    /// Live-UI-only "thinking" stream chunks.
    ReasoningChunk,
    /// Model-only records of user decisions about actions.
    UserDecision,
    /// Unknown wire value, preserved verbatim.
    Other(String),
}

impl EventType {
    /// Wire value of this event type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::WorkflowStarted => "workflow_started",
            Self::WorkflowCompleted => "workflow_completed",
            Self::StepStarted => "step_started",
            Self::StepProgress => "step_progress",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::ToolExecuted => "tool_executed",
            Self::ToolCompleted => "tool_completed",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
            Self::AgentMessage => "agent_message",
            Self::TokenChunk => "token_chunk",
            Self::WorkflowInterruption => "workflow_interruption",
            Self::ReasoningChunk => "reasoning_chunk",
            Self::UserDecision => "user_decision",
            Self::Other(value) => value,
        }
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        match value {
            "workflow_started" => Self::WorkflowStarted,
            "workflow_completed" => Self::WorkflowCompleted,
            "step_started" => Self::StepStarted,
            "step_progress" => Self::StepProgress,
            "step_completed" => Self::StepCompleted,
            "step_failed" => Self::StepFailed,
            "tool_executed" => Self::ToolExecuted,
            "tool_completed" => Self::ToolCompleted,
            "error" => Self::Error,
            "heartbeat" => Self::Heartbeat,
            "agent_message" => Self::AgentMessage,
            "token_chunk" => Self::TokenChunk,
            "workflow_interruption" => Self::WorkflowInterruption,
            "reasoning_chunk" => Self::ReasoningChunk,
            "user_decision" => Self::UserDecision,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match Self::from(value.as_str()) {
            // Reuse the allocation for unknown values.
            Self::Other(_) => Self::Other(value),
            known => known,
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        match value {
            EventType::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a unique event ID for SSE `Last-Event-ID` support.
#[must_use]
pub fn generate_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current time as unix seconds.
#[must_use]
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

fn default_true() -> bool {
    true
}

/// A single streaming event with a unique ID for replay support.
///
/// JSON field names are stable wire contract; fields whose value is absent
/// are omitted from the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Event type (wire value).
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Globally unique event ID, assigned at construction.
    #[serde(rename = "eventId", default = "generate_event_id")]
    pub event_id: String,

    /// Session this event belongs to.
    #[serde(rename = "sessionId", default)]
    pub session_id: String,

    /// Unix seconds at construction.
    #[serde(default)]
    pub timestamp: f64,

    /// Workflow step number, if any.
    #[serde(rename = "step", default, skip_serializing_if = "Option::is_none")]
    pub step_number: Option<u32>,

    /// Human-readable message.
    #[serde(default)]
    pub message: String,

    /// Free-form event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Progress percentage in `0.0..=100.0`.
    #[serde(rename = "progress", default, skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<f64>,

    /// Name of the tool involved, if any.
    #[serde(rename = "tool", default, skip_serializing_if = "Option::is_none")]
    pub tool_used: Option<String>,

    /// Duration of the described operation in milliseconds.
    #[serde(rename = "duration", default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Whether the described operation succeeded.
    #[serde(default = "default_true")]
    pub success: bool,

    /// Audience tag.
    #[serde(default)]
    pub visibility: EventVisibility,

    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl StreamEvent {
    /// Create an event stamped with the current time and a fresh ID.
    #[must_use]
    pub fn new(
        event_type: impl Into<EventType>,
        session_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            event_id: generate_event_id(),
            session_id: session_id.into(),
            timestamp: unix_now(),
            step_number: None,
            message: message.into(),
            data: None,
            progress_percent: None,
            tool_used: None,
            duration_ms: None,
            success: true,
            visibility: EventVisibility::default(),
            metadata: None,
        }
    }

    /// Set the step number.
    #[must_use]
    pub const fn with_step(mut self, step_number: u32) -> Self {
        self.step_number = Some(step_number);
        self
    }

    /// Attach a free-form payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Set the progress percentage.
    #[must_use]
    pub const fn with_progress(mut self, progress_percent: f64) -> Self {
        self.progress_percent = Some(progress_percent);
        self
    }

    /// Record the tool involved.
    #[must_use]
    pub fn with_tool(mut self, tool_used: impl Into<String>) -> Self {
        self.tool_used = Some(tool_used.into());
        self
    }

    /// Record the operation duration.
    #[must_use]
    pub const fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Mark success or failure.
    #[must_use]
    pub const fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    /// Set the audience tag.
    #[must_use]
    pub const fn with_visibility(mut self, visibility: EventVisibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// Attach free-form metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Override the timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Serialize to JSON.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Deserialize from JSON, permissively.
    ///
    /// Unknown event types are preserved as strings and unknown visibility
    /// values coerce to `user_facing`.
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Convert to SSE wire form with an `id:` line for reconnection support.
    #[must_use]
    pub fn to_sse(&self) -> String {
        let body = serde_json::to_string(self).unwrap_or_default();
        format!(
            "id: {}\nevent: message\ndata: {}\n\n",
            self.event_id, body
        )
    }
}
