//! Transport adapters.
//!
//! The core produces framed wire payloads; these modules expose them over
//! HTTP Server-Sent Events and WebSockets.

pub mod http;
pub mod ws;

pub use http::create_router;
pub use ws::WebSocketHandler;
