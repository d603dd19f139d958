//! Client error types.

use parley_session::{ConnectionError, SendRejected};
use thiserror::Error;

/// Errors surfaced by the client runtime.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Configuration error (bad URL, bad environment value).
    #[error("Configuration error: {0}")]
    Config(String),

    /// WebSocket connection or I/O error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Network/HTTP error.
    #[error("Network error: {0}")]
    Network(String),

    /// The backend answered a one-shot call with an error.
    #[error("Server returned {status}: {message}")]
    Api { status: u16, message: String },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid request to the connection state machine.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// User input refused by the session.
    #[error("Message not sent: {0}")]
    Rejected(#[from] SendRejected),

    /// The backend answered the channel upgrade with an HTTP error.
    #[error("Session channel refused with status {status}")]
    Refused { status: u16 },

    /// The channel is closed.
    #[error("Channel closed")]
    Closed,
}

impl ClientError {
    /// Whether reconnecting cannot succeed: the session is unknown, invalid
    /// or already ended.
    pub fn is_permanent_refusal(&self) -> bool {
        matches!(self, ClientError::Refused { status: 400 | 403 | 404 | 410 })
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Network(format!("Request timed out: {err}"))
        } else if err.is_connect() {
            ClientError::Network(format!("Connection failed: {err}"))
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => ClientError::Closed,
            WsError::Http(response) => ClientError::Refused {
                status: response.status().as_u16(),
            },
            other => ClientError::WebSocket(other.to_string()),
        }
    }
}

/// Result type for client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;
