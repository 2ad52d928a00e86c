//! WebSocket transport: the same event payloads as SSE, framed as text
//! messages, with bidirectional dispatch for inbound client messages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::service::StreamWeaver;

/// Handler for an inbound `{type, …}` message: `(session_id, payload)`.
///
/// Failures are reported back to the client and logged; they never tear
/// down the connection.
pub type WsMessageHandler = Arc<dyn Fn(&str, Value) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(rename = "lastEventId")]
    last_event_id: Option<String>,
}

/// Serves per-session event streams over WebSockets.
pub struct WebSocketHandler {
    weaver: Arc<StreamWeaver>,
    ping_interval: Duration,
    handlers: RwLock<HashMap<String, WsMessageHandler>>,
}

impl WebSocketHandler {
    /// Create a handler bound to the service.
    #[must_use]
    pub fn new(weaver: Arc<StreamWeaver>) -> Self {
        let ping_interval = weaver.config().ping_interval;
        Self { weaver, ping_interval, handlers: RwLock::new(HashMap::new()) }
    }

    /// Register a handler for an inbound message type.
    pub async fn register_message_handler(
        &self,
        message_type: impl Into<String>,
        handler: WsMessageHandler,
    ) {
        let message_type = message_type.into();
        tracing::debug!(%message_type, "registered websocket message handler");
        self.handlers.write().await.insert(message_type, handler);
    }

    /// Router exposing `/ws/{session_id}`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route("/ws/{session_id}", any(handle_upgrade)).with_state(self)
    }

    async fn run(self: Arc<Self>, socket: WebSocket, session_id: String, last_event_id: Option<String>) {
        let stream = match self.weaver.subscribe(&session_id, last_event_id, None).await {
            Ok(stream) => stream,
            Err(error) => {
                let mut socket = socket;
                let frame = serde_json::json!({ "type": "error", "message": error.to_string() });
                let _ = socket.send(Message::Text(frame.to_string().into())).await;
                let _ = socket.close().await;
                return;
            }
        };

        tracing::info!(session_id = %session_id, "websocket connected");

        let (mut sender, mut receiver) = socket.split();
        let mut stream = Box::pin(stream);
        let mut ping = tokio::time::interval(self.ping_interval);
        // The first tick completes immediately.
        ping.tick().await;

        'conn: loop {
            tokio::select! {
                payload = stream.next() => {
                    let Some(payload) = payload else { break 'conn };
                    for value in parse_sse_payload(&payload) {
                        let completed =
                            value.get("type").and_then(Value::as_str) == Some("workflow_completed");
                        if sender.send(Message::Text(value.to_string().into())).await.is_err() {
                            tracing::debug!(session_id = %session_id, "websocket send failed");
                            break 'conn;
                        }
                        if completed {
                            break 'conn;
                        }
                    }
                }
                incoming = receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            self.dispatch(&session_id, text.as_str(), &mut sender).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break 'conn,
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            tracing::debug!(session_id = %session_id, %error, "websocket receive failed");
                            break 'conn;
                        }
                    }
                }
                _ = ping.tick() => {
                    let frame = serde_json::json!({ "type": "ping", "session_id": session_id });
                    if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                        break 'conn;
                    }
                }
            }
        }

        let _ = sender.close().await;
        tracing::info!(session_id = %session_id, "websocket disconnected");
    }

    async fn dispatch(
        &self,
        session_id: &str,
        text: &str,
        sender: &mut (impl SinkExt<Message> + Unpin),
    ) {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            tracing::debug!(session_id = %session_id, "ignoring non-JSON websocket message");
            return;
        };
        let message_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let handler = { self.handlers.read().await.get(&message_type).cloned() };
        match handler {
            Some(handler) => {
                if let Err(error) = handler(session_id, value) {
                    tracing::error!(session_id = %session_id, %error, "websocket handler failed");
                    let frame = serde_json::json!({
                        "type": "error",
                        "message": format!("Handler error: {error}"),
                    });
                    let _ = sender.send(Message::Text(frame.to_string().into())).await;
                }
            }
            None => tracing::debug!(%message_type, "no handler for message type"),
        }
    }
}

impl std::fmt::Debug for WebSocketHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketHandler")
            .field("ping_interval", &self.ping_interval)
            .finish()
    }
}

async fn handle_upgrade(
    State(handler): State<Arc<WebSocketHandler>>,
    Path(session_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handler.run(socket, session_id, query.last_event_id))
}

/// Extract the JSON payloads from one SSE-framed chunk.
///
/// A chunk may carry several frames (a flushed batch followed by an
/// immediate event); each `data:` line yields one value.
fn parse_sse_payload(payload: &str) -> Vec<Value> {
    payload
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter_map(|data| serde_json::from_str(data).ok())
        .collect()
}
