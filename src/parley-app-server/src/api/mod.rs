//! REST API routes and handlers.

mod health;
mod sessions;
pub mod types;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::state::AppState;

pub use health::health_check;
pub use types::{
    CreateSessionResponse, EndSessionResponse, HealthResponse, SessionListItem, SessionResponse,
};

/// Create the API routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/sessions",
            post(sessions::create_session).get(sessions::list_sessions),
        )
        .route("/sessions/{id}", get(sessions::get_session))
        .route("/sessions/{id}/end", post(sessions::end_session))
}
