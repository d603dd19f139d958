//! Session lifecycle endpoints.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tracing::info;

use crate::error::AppResult;
use crate::state::AppState;

use super::types::{
    CreateSessionResponse, EndSessionResponse, ListSessionsQuery, SessionListItem,
    SessionResponse,
};

/// Create a new session.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
) -> AppResult<(StatusCode, Json<CreateSessionResponse>)> {
    let session = state.storage().create_session()?;
    let redirect_url = state.config.redirect_url(&session.id);
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.id,
            redirect_url,
        }),
    ))
}

/// List stored sessions, most recently active first.
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSessionsQuery>,
) -> AppResult<Json<Vec<SessionListItem>>> {
    let sessions = state.storage().list_sessions()?;
    Ok(Json(
        sessions
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(SessionListItem::from)
            .collect(),
    ))
}

/// Get a session and its ordered messages.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<SessionResponse>> {
    let session = state.storage().load_session(&id)?;
    let turn_running = if state.sessions.is_live(&id).await {
        state.sessions.live(&id).await?.turn_running().await
    } else {
        false
    };
    let messages = state.storage().read_history(&id)?;

    Ok(Json(SessionResponse {
        session: session.into(),
        turn_running,
        messages,
    }))
}

/// End a session. Any live channel for it is closed.
pub async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<EndSessionResponse>> {
    let session = state.sessions.end_session(&id).await?;
    info!(session_id = %id, "Session ended via API");
    Ok(Json(EndSessionResponse {
        session_id: session.id,
        status: session.status.as_str().to_string(),
    }))
}
