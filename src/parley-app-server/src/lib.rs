//! Parley App Server - HTTP and WebSocket backend for chat sessions.
//!
//! This crate provides:
//! - REST API to create, inspect and end sessions
//! - A per-session WebSocket channel that replays history and streams
//!   assistant turns produced by an [`AgentBridge`]
//! - A file-backed session store with periodic cleanup of ended sessions

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod session_manager;
pub mod state;
pub mod storage;
pub mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Json, Router, routing::get};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use bridge::{AgentBridge, BridgeError, BridgeEvent, EchoBridge, ScriptedBridge, TurnRequest};
pub use config::ServerConfig;
pub use error::{AppError, AppResult};
pub use session_manager::{SessionError, SessionManager};
pub use state::AppState;
pub use storage::{SessionStatus, SessionStorage, StorageError, StoredSession};

/// Run the server with the given configuration.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    run_with_shutdown(config, std::future::pending()).await
}

/// Run the server with graceful shutdown support.
pub async fn run_with_shutdown<F>(config: ServerConfig, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = config.listen_addr.parse()?;
    let state = Arc::new(AppState::new(config)?);

    let listener = TcpListener::bind(addr).await?;
    info!("Starting Parley server on {}", addr);
    serve(listener, state, shutdown).await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let cleanup = state.start_cleanup_task();
    let app = create_router_with_state(Arc::clone(&state));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Server shutting down, closing live sessions...");
    cleanup.abort();
    state.sessions.shutdown_all().await;
    Ok(())
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    create_router_with_state(Arc::new(state))
}

/// Create the application router with an Arc-wrapped state.
pub fn create_router_with_state(state: Arc<AppState>) -> Router {
    let api_routes = api::routes().merge(websocket::routes());

    Router::new()
        .route("/", get(root))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "parley" }))
}
