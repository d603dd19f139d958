//! Client configuration.

use std::time::Duration;

use parley_session::ReconnectPolicy;
use url::Url;

use crate::error::{ClientError, ClientResult};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP base URL of the backend (e.g., "http://127.0.0.1:8000").
    pub server_url: Url,

    /// Reconnect bound and backoff unit.
    pub reconnect: ReconnectPolicy,

    /// Timeout for one-shot HTTP calls.
    pub request_timeout: Duration,
}

fn default_server_url() -> Url {
    Url::parse("http://127.0.0.1:8000").expect("default server URL is valid")
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            reconnect: ReconnectPolicy::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: &str) -> ClientResult<Self> {
        Ok(Self {
            server_url: parse_server_url(server_url)?,
            ..Self::default()
        })
    }

    /// Load from environment variables.
    pub fn from_env() -> ClientResult<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("PARLEY_SERVER_URL") {
            config.server_url = parse_server_url(&url)?;
        }

        if let Ok(base) = std::env::var("PARLEY_RECONNECT_BASE_MS") {
            let millis: u64 = base.parse().map_err(|_| {
                ClientError::Config(format!("PARLEY_RECONNECT_BASE_MS is not a number: {base}"))
            })?;
            config.reconnect.base_delay = Duration::from_millis(millis);
        }

        if let Ok(max) = std::env::var("PARLEY_RECONNECT_MAX_ATTEMPTS") {
            config.reconnect.max_attempts = max.parse().map_err(|_| {
                ClientError::Config(format!(
                    "PARLEY_RECONNECT_MAX_ATTEMPTS is not a number: {max}"
                ))
            })?;
        }

        Ok(config)
    }

    /// WebSocket endpoint of a session's channel.
    pub fn channel_url(&self, session_id: &str) -> ClientResult<Url> {
        let mut url = self.endpoint(&["ws", "sessions", session_id])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Config(format!("cannot derive channel URL from {url}")))?;
        Ok(url)
    }

    /// REST endpoint under `/api/v1`.
    pub fn endpoint(&self, segments: &[&str]) -> ClientResult<Url> {
        let mut url = self.server_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Config(format!("{} cannot be a base URL", self.server_url)))?
            .pop_if_empty()
            .extend(["api", "v1"])
            .extend(segments);
        Ok(url)
    }
}

fn parse_server_url(raw: &str) -> ClientResult<Url> {
    let url = Url::parse(raw)
        .map_err(|e| ClientError::Config(format!("invalid server URL {raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ClientError::Config(format!(
            "server URL must be http or https, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let config = ClientConfig::default();
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.base_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_channel_url() {
        let config = ClientConfig::new("http://localhost:8000").unwrap();
        assert_eq!(
            config.channel_url("abc").unwrap().as_str(),
            "ws://localhost:8000/api/v1/ws/sessions/abc"
        );

        let config = ClientConfig::new("https://chat.example.com/").unwrap();
        assert_eq!(
            config.channel_url("abc").unwrap().as_str(),
            "wss://chat.example.com/api/v1/ws/sessions/abc"
        );
    }

    #[test]
    fn test_endpoint_under_prefix() {
        let config = ClientConfig::new("http://host/base/").unwrap();
        assert_eq!(
            config.endpoint(&["sessions", "s1", "end"]).unwrap().as_str(),
            "http://host/base/api/v1/sessions/s1/end"
        );
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(matches!(
            ClientConfig::new("ftp://host"),
            Err(ClientError::Config(_))
        ));
        assert!(ClientConfig::new("not a url").is_err());
    }
}
