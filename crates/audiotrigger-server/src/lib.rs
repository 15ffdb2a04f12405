//! Audiotrigger status server - Axum
//!
//! Read-only view of a running engine, reachable from local tools and
//! remote browsers:
//! - `GET /api/v1/status` - latest engine snapshot
//! - `GET /api/v1/config` - effective configuration (credentials redacted)
//! - `GET /api/v1/ws` - WebSocket mirror of every bus message
//!
//! There are no mutating routes; configuration is fixed at startup.

pub mod api;
pub mod ws;

use audiotrigger_core::bus::Topics;
use audiotrigger_core::{BroadcastBus, StatusHandle, TriggerConfig};
use axum::http::{header, HeaderValue};
use axum::Router;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    /// Engine snapshot reader
    pub status: StatusHandle,
    /// In-process bus mirrored over WebSocket
    pub bus: BroadcastBus,
    /// Effective configuration with secrets redacted
    pub config: Arc<TriggerConfig>,
    pub topics: Topics,
    /// Input device description
    pub device: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Create the state from the engine's status handle and bus
    pub fn new(
        status: StatusHandle,
        bus: BroadcastBus,
        config: &TriggerConfig,
        device: Option<String>,
    ) -> Self {
        Self {
            status,
            bus,
            topics: Topics::new(&config.topic_base),
            config: Arc::new(config.redacted()),
            device,
            started_at: Utc::now(),
        }
    }
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Bind address
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8099,
            bind_addr: "0.0.0.0".to_string(),
        }
    }
}

impl ServerConfig {
    /// All interfaces on the configured UI port
    pub fn from_trigger_config(config: &TriggerConfig) -> Self {
        Self {
            port: config.ui_port,
            ..Self::default()
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// Build the Axum router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", axum::routing::get(api::get_status))
        .route("/api/v1/config", axum::routing::get(api::get_config))
        .route("/api/v1/ws", axum::routing::get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Bind and start the web server
pub async fn start_server<F>(state: AppState, config: &ServerConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Audiotrigger status server listening");
    serve(listener, state, shutdown).await?;
    tracing::info!("Status server stopped");
    Ok(())
}
