//! StreamWeaver server - entry point.
//!
//! Serves the SSE transport (and optionally WebSockets) over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use streamweaver::transport::{create_router, WebSocketHandler};
use streamweaver::{StreamConfig, StreamWeaver};

#[derive(Parser, Debug)]
#[command(name = "streamweaver")]
#[command(about = "Session-scoped event streaming for agentic workflows")]
#[command(version)]
struct Cli {
    /// HTTP server port
    #[arg(long, default_value = "8000", env = "PORT")]
    port: u16,

    /// Enable the WebSocket endpoint alongside SSE
    #[arg(long)]
    enable_websocket: bool,

    /// Enable metrics collection and the /metrics endpoint
    #[arg(long)]
    enable_metrics: bool,

    /// Enable gzip compression of large SSE payloads
    #[arg(long)]
    enable_compression: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.json_logs);

    let mut config = StreamConfig::from_env()?;
    config.enable_metrics |= cli.enable_metrics;
    config.enable_compression |= cli.enable_compression;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cli.port,
        websocket = cli.enable_websocket,
        "Starting StreamWeaver server"
    );

    let weaver = Arc::new(StreamWeaver::new(config));
    weaver.initialize().await;

    let mut router = create_router(Arc::clone(&weaver));
    if cli.enable_websocket {
        let ws = Arc::new(WebSocketHandler::new(Arc::clone(&weaver)));
        router = router.merge(ws.router());
        tracing::info!("WebSocket endpoint enabled");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;

    weaver.shutdown().await;
    tracing::info!("HTTP server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Failed to install CTRL+C handler");
    }
    tracing::info!("Received shutdown signal");
}
