//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:8000").
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Directory holding session metadata and history files.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Public origin used to build redirect URLs for new sessions.
    /// Empty means redirect URLs are relative.
    #[serde(default)]
    pub public_base_url: String,

    /// Ended sessions idle longer than this are deleted.
    #[serde(default = "default_session_retention_days")]
    pub session_retention_days: u64,

    /// Interval between background cleanup runs in seconds.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Agent bridge configuration.
    #[serde(default)]
    pub bridge: BridgeConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_session_retention_days() -> u64 {
    7
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            storage_dir: default_storage_dir(),
            public_base_url: String::new(),
            session_retention_days: default_session_retention_days(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            shutdown_timeout: default_shutdown_timeout(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from file.
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Load from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PARLEY_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        if let Ok(dir) = std::env::var("PARLEY_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }

        if let Ok(url) = std::env::var("PARLEY_PUBLIC_URL") {
            config.public_base_url = url.trim_end_matches('/').to_string();
        }

        if let Ok(days) = std::env::var("PARLEY_SESSION_RETENTION_DAYS") {
            config.session_retention_days = days
                .parse()
                .context("PARLEY_SESSION_RETENTION_DAYS must be a whole number of days")?;
        }

        if let Ok(secs) = std::env::var("PARLEY_CLEANUP_INTERVAL_SECS") {
            config.cleanup_interval_secs = secs
                .parse()
                .context("PARLEY_CLEANUP_INTERVAL_SECS must be a whole number of seconds")?;
        }

        if let Ok(demo) = std::env::var("PARLEY_TOOL_DEMO") {
            config.bridge.tool_demo = matches!(demo.as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_days * 24 * 60 * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    /// Where a client should go to open the session.
    pub fn redirect_url(&self, session_id: &str) -> String {
        format!("{}/chat/{}", self.public_base_url, session_id)
    }
}

/// Agent bridge selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bridge implementation.
    #[serde(default)]
    pub kind: BridgeKind,

    /// Route echoed prompts through a demo tool call.
    #[serde(default)]
    pub tool_demo: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeKind {
    #[default]
    Echo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8000");
        assert_eq!(config.session_retention_days, 7);
        assert_eq!(config.retention(), Duration::from_secs(7 * 86_400));
        assert_eq!(config.bridge.kind, BridgeKind::Echo);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"listen_addr":"127.0.0.1:9000","bridge":{"tool_demo":true}}"#)
                .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert!(config.bridge.tool_demo);
        assert_eq!(config.shutdown_timeout, 30);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(&path, r#"{"public_base_url":"https://chat.example"}"#).unwrap();
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.redirect_url("abc"), "https://chat.example/chat/abc");
    }

    #[test]
    fn test_relative_redirect() {
        assert_eq!(ServerConfig::default().redirect_url("abc"), "/chat/abc");
    }
}
