//! Application state shared across request handlers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bridge::{AgentBridge, EchoBridge};
use crate::config::{BridgeKind, ServerConfig};
use crate::error::AppResult;
use crate::session_manager::SessionManager;
use crate::storage::SessionStorage;

pub struct AppState {
    pub config: ServerConfig,
    pub sessions: SessionManager,
    start_time: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("start_time", &self.start_time)
            .finish()
    }
}

impl AppState {
    /// Opens the store and builds the configured agent bridge.
    pub fn new(config: ServerConfig) -> AppResult<Self> {
        let bridge: Arc<dyn AgentBridge> = match config.bridge.kind {
            BridgeKind::Echo => Arc::new(EchoBridge::new().with_tool_demo(config.bridge.tool_demo)),
        };
        Self::with_bridge(config, bridge)
    }

    /// State with an explicit bridge.
    pub fn with_bridge(config: ServerConfig, bridge: Arc<dyn AgentBridge>) -> AppResult<Self> {
        let storage = Arc::new(SessionStorage::new(&config.storage_dir)?);
        Ok(Self {
            sessions: SessionManager::new(storage, bridge),
            config,
            start_time: Instant::now(),
        })
    }

    pub fn storage(&self) -> &Arc<SessionStorage> {
        self.sessions.storage()
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// One cleanup pass: deletes stale ended sessions and unloads idle ones.
    pub async fn cleanup(&self) {
        match self.storage().cleanup_ended(self.config.retention()) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Deleted expired sessions"),
            Err(e) => warn!(error = %e, "Session cleanup failed"),
        }
        let evicted = self.sessions.evict_idle().await;
        let live = self.sessions.live_count().await;
        debug!(evicted, live, "Background cleanup completed");
    }

    /// Start background cleanup task that runs periodically.
    /// Call this after wrapping AppState in Arc to start the cleanup loop.
    pub fn start_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        let period = self.config.cleanup_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                state.cleanup().await;
            }
        })
    }
}
