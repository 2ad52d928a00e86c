//! HTTP transport: SSE streaming plus session management routes.
//!
//! The stream endpoint serves the core's already-framed payloads as a raw
//! `text/event-stream` body. Reconnection honors the `Last-Event-ID` header
//! over the `lastEventId` query parameter; unknown sessions map to 404.

use std::convert::Infallible;
use std::io::Write as _;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::service::StreamWeaver;

static LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");

/// Query parameters for the stream endpoint.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(rename = "lastEventId")]
    last_event_id: Option<String>,
}

/// Query parameters for the replay endpoint.
#[derive(Debug, Deserialize)]
pub struct ReplayQuery {
    /// Event ID to replay from.
    after: String,
}

/// Create the HTTP router for the streaming service.
pub fn create_router(weaver: Arc<StreamWeaver>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers([header::CACHE_CONTROL, LAST_EVENT_ID.clone()]);

    Router::new()
        .route("/health", get(health_check))
        .route("/stream/{session_id}", get(handle_stream))
        .route("/stream/{session_id}/status", get(handle_status))
        .route("/stream/{session_id}/close", post(handle_close))
        .route("/stream/{session_id}/replay", get(handle_replay))
        .route("/metrics", get(handle_metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(weaver)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "streamweaver",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

fn not_found(session_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "detail": format!("Session not found: {session_id}") })),
    )
        .into_response()
}

/// Serve the SSE stream for a session.
async fn handle_stream(
    State(weaver): State<Arc<StreamWeaver>>,
    Path(session_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    // The Last-Event-ID header takes precedence over the query parameter.
    let last_event_id = headers
        .get(&LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .or(query.last_event_id);

    let reconnecting = last_event_id.is_some();
    let stream = match weaver.subscribe(&session_id, last_event_id, None).await {
        Ok(stream) => stream,
        Err(_) => return not_found(&session_id),
    };
    tracing::info!(session_id = %session_id, reconnecting, "sse stream connected");

    let config = weaver.config();
    let accepts_gzip = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("gzip"));
    let compress = config.enable_compression && accepts_gzip;
    let threshold = config.compression_threshold;

    let mut response = if compress {
        let body = Body::from_stream(
            stream.map(move |chunk| Ok::<_, Infallible>(gzip_chunk(&chunk, threshold))),
        );
        let mut response = Response::new(body);
        response
            .headers_mut()
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        response
    } else {
        Response::new(Body::from_stream(
            stream.map(|chunk| Ok::<_, Infallible>(Bytes::from(chunk))),
        ))
    };

    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

/// Gzip one payload when it clears the threshold.
fn gzip_chunk(chunk: &str, threshold: usize) -> Bytes {
    if chunk.len() >= threshold {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        if encoder.write_all(chunk.as_bytes()).is_ok() {
            if let Ok(compressed) = encoder.finish() {
                return Bytes::from(compressed);
            }
        }
    }
    Bytes::copy_from_slice(chunk.as_bytes())
}

/// Current status of a session.
async fn handle_status(
    State(weaver): State<Arc<StreamWeaver>>,
    Path(session_id): Path<String>,
) -> Response {
    let Some(session) = weaver.get_session(&session_id).await else {
        return not_found(&session_id);
    };

    let queue = weaver.queue_stats(&session_id).await;
    Json(serde_json::json!({
        "sessionId": session.session_id,
        "status": session.status.as_str(),
        "progress": format!("{}/{}", session.completed_steps, session.total_steps),
        "currentStep": session.current_step,
        "createdAt": session.created_at,
        "lastActivity": session.last_activity,
        "queue": queue,
    }))
    .into_response()
}

/// Close an active stream.
async fn handle_close(
    State(weaver): State<Arc<StreamWeaver>>,
    Path(session_id): Path<String>,
    body: Option<Json<serde_json::Value>>,
) -> Response {
    if weaver.get_session(&session_id).await.is_none() {
        return not_found(&session_id);
    }

    let reason = body
        .as_ref()
        .and_then(|Json(value)| value.get("reason"))
        .and_then(|value| value.as_str())
        .unwrap_or("Client requested closure")
        .to_string();

    weaver.close_stream(&session_id, Some(&reason)).await;
    Json(serde_json::json!({
        "success": true,
        "message": format!("Stream closed for session {session_id}"),
        "sessionId": session_id,
        "reason": reason,
    }))
    .into_response()
}

/// Events for replay after a specific event ID.
async fn handle_replay(
    State(weaver): State<Arc<StreamWeaver>>,
    Path(session_id): Path<String>,
    Query(query): Query<ReplayQuery>,
) -> Response {
    if weaver.get_session(&session_id).await.is_none() {
        return not_found(&session_id);
    }

    let events = weaver.get_replay_events(&session_id, &query.after).await;
    Json(serde_json::json!({
        "sessionId": session_id,
        "eventCount": events.len(),
        "events": events.iter().map(crate::events::StreamEvent::to_json).collect::<Vec<_>>(),
    }))
    .into_response()
}

/// Prometheus metrics exposition.
async fn handle_metrics(State(weaver): State<Arc<StreamWeaver>>) -> Response {
    match weaver.metrics() {
        Some(metrics) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_chunk_below_threshold_passes_through() {
        let chunk = "small";
        let bytes = gzip_chunk(chunk, 1024);
        assert_eq!(bytes.as_ref(), chunk.as_bytes());
    }

    #[test]
    fn test_gzip_chunk_above_threshold_compresses() {
        let chunk = "x".repeat(4096);
        let bytes = gzip_chunk(&chunk, 1024);
        // Gzip magic bytes, and repetitive input must shrink.
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        assert!(bytes.len() < chunk.len());
    }
}
