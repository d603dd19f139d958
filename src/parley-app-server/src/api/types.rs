//! API request and response types.

use parley_protocol::HistoryMessage;
use serde::{Deserialize, Serialize};

use crate::storage::StoredSession;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub live_sessions: usize,
}

/// Response of session creation.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub redirect_url: String,
}

/// Session metadata without messages.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionListItem {
    pub id: String,
    pub status: String,
    pub created_at: i64,
    pub last_activity: i64,
}

impl From<StoredSession> for SessionListItem {
    fn from(session: StoredSession) -> Self {
        Self {
            status: session.status.as_str().to_string(),
            id: session.id,
            created_at: session.created_at,
            last_activity: session.last_activity,
        }
    }
}

/// A session with its ordered messages.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub session: SessionListItem,
    /// Whether a turn is being produced right now.
    pub turn_running: bool,
    pub messages: Vec<HistoryMessage>,
}

/// Result of ending a session.
#[derive(Debug, Serialize, Deserialize)]
pub struct EndSessionResponse {
    pub session_id: String,
    pub status: String,
}

/// Query parameters for listing sessions.
#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}
