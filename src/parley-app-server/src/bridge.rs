//! Agent bridge seam.
//!
//! A bridge produces the content of one assistant turn. The session manager
//! owns the turn boundaries: it emits `assistant_start` before calling
//! [`AgentBridge::run_turn`] and `assistant_end` after it returns, whatever
//! the outcome.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use parley_protocol::{HistoryMessage, ServerEvent};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Input for one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub content: String,
    /// Finalized history preceding the user message.
    pub history: Vec<HistoryMessage>,
}

/// One piece of an assistant turn.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        is_error: bool,
    },
    /// Session-level failure reported by the agent.
    Error(String),
}

impl From<BridgeEvent> for ServerEvent {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Text(content) => ServerEvent::AssistantChunk { content },
            BridgeEvent::ToolUse { id, name, input } => ServerEvent::ToolUse { id, name, input },
            BridgeEvent::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => ServerEvent::ToolResult {
                tool_use_id,
                content,
                is_error,
            },
            BridgeEvent::Error(content) => ServerEvent::Error { content },
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Agent unavailable: {0}")]
    Unavailable(String),

    #[error("Turn aborted: {0}")]
    Aborted(String),

    /// The receiving side went away mid-turn.
    #[error("Event sink closed")]
    SinkClosed,
}

impl<T> From<mpsc::error::SendError<T>> for BridgeError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self::SinkClosed
    }
}

/// Producer of assistant turns.
#[async_trait]
pub trait AgentBridge: Send + Sync {
    /// Streams the events of one turn into `sink` in causal order:
    /// a tool call's `ToolUse` precedes its `ToolResult`.
    async fn run_turn(
        &self,
        request: TurnRequest,
        sink: mpsc::Sender<BridgeEvent>,
    ) -> Result<(), BridgeError>;
}

/// Deterministic bridge that streams the prompt back word by word.
#[derive(Debug, Clone, Default)]
pub struct EchoBridge {
    tool_demo: bool,
    delay: Duration,
}

impl EchoBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs each prompt through an `echo` tool call before answering.
    pub fn with_tool_demo(mut self, enabled: bool) -> Self {
        self.tool_demo = enabled;
        self
    }

    /// Pause between streamed fragments.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl AgentBridge for EchoBridge {
    async fn run_turn(
        &self,
        request: TurnRequest,
        sink: mpsc::Sender<BridgeEvent>,
    ) -> Result<(), BridgeError> {
        debug!(
            session_id = %request.session_id,
            history = request.history.len(),
            "Echo bridge turn"
        );

        if self.tool_demo {
            let id = format!("echo-{}", request.history.len());
            sink.send(BridgeEvent::ToolUse {
                id: id.clone(),
                name: "echo".to_string(),
                input: json!({ "text": request.content }),
            })
            .await?;
            sink.send(BridgeEvent::ToolResult {
                tool_use_id: id,
                content: Value::String(request.content.clone()),
                is_error: false,
            })
            .await?;
        }

        for (i, word) in request.content.split_inclusive(' ').enumerate() {
            if i > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            sink.send(BridgeEvent::Text(word.to_string())).await?;
        }
        Ok(())
    }
}

/// Replays a fixed script for every turn. Used by tests and demos.
#[derive(Debug, Default)]
pub struct ScriptedBridge {
    events: Vec<BridgeEvent>,
    failure: Option<String>,
    requests: Mutex<Vec<TurnRequest>>,
}

impl ScriptedBridge {
    pub fn new(events: Vec<BridgeEvent>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    /// Fails every turn with `message` after the scripted events.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AgentBridge for ScriptedBridge {
    async fn run_turn(
        &self,
        request: TurnRequest,
        sink: mpsc::Sender<BridgeEvent>,
    ) -> Result<(), BridgeError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        for event in &self.events {
            sink.send(event.clone()).await?;
        }
        match &self.failure {
            Some(message) => Err(BridgeError::Unavailable(message.clone())),
            None => Ok(()),
        }
    }
}
