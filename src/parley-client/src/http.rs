//! One-shot HTTP calls made outside the streaming channel.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Session lifecycle operations the client needs from the backend.
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Terminates the session. Succeeds or fails as a whole.
    async fn end_session(&self, session_id: &str) -> ClientResult<()>;
}

/// Response of `POST /api/v1/sessions`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedSession {
    pub session_id: String,
    #[serde(default)]
    pub redirect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// reqwest-backed REST client.
#[derive(Debug, Clone)]
pub struct SessionApi {
    client: reqwest::Client,
    config: ClientConfig,
}

impl SessionApi {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates a new session.
    pub async fn create_session(&self) -> ClientResult<CreatedSession> {
        let url = self.config.endpoint(&["sessions"])?;
        let response = self.client.post(url).send().await?;
        let response = check_status(response).await?;
        let created: CreatedSession = response.json().await?;
        info!(session_id = %created.session_id, "Created session");
        Ok(created)
    }
}

#[async_trait]
impl SessionControl for SessionApi {
    async fn end_session(&self, session_id: &str) -> ClientResult<()> {
        let url = self.config.endpoint(&["sessions", session_id, "end"])?;
        debug!(%url, "Ending session");
        let response = self.client.post(url).send().await?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> ClientResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|parsed| parsed.error.message)
        .unwrap_or(body);
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}
