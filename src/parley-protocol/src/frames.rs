//! Typed frames carried over a session channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::IntoStaticStr;

use crate::history::{HistoryMessage, empty_object};

/// Events streamed from the backend to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServerEvent {
    /// Ordered prior messages. Sent once, first, on every fresh connection.
    History {
        #[serde(default)]
        messages: Vec<HistoryMessage>,
    },
    /// Echo of a user message accepted by the backend.
    UserMessage { content: String },
    /// Begins a new assistant turn.
    AssistantStart,
    /// Text fragment for the active turn.
    AssistantChunk { content: String },
    /// Opens a tool call inside the active turn.
    ToolUse {
        id: String,
        name: String,
        #[serde(default = "empty_object")]
        input: Value,
    },
    /// Resolves a previously opened tool call.
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    /// Finalizes the active turn.
    AssistantEnd,
    /// Session-level failure, not tied to a tool call.
    Error { content: String },
    /// Ephemeral informational signal. Never persisted.
    Status { content: String },
}

impl ServerEvent {
    /// Wire discriminant of this event.
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    /// Every discriminant the decoder accepts.
    pub const KINDS: [&'static str; 9] = [
        "history",
        "user_message",
        "assistant_start",
        "assistant_chunk",
        "tool_use",
        "tool_result",
        "assistant_end",
        "error",
        "status",
    ];

    pub fn chunk(content: impl Into<String>) -> Self {
        Self::AssistantChunk {
            content: content.into(),
        }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: Value, is_error: bool) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content,
            is_error,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
        }
    }

    pub fn status(content: impl Into<String>) -> Self {
        Self::Status {
            content: content.into(),
        }
    }

    /// Whether this event belongs to the assistant turn currently in flight.
    pub fn is_turn_event(&self) -> bool {
        matches!(
            self,
            Self::AssistantStart
                | Self::AssistantChunk { .. }
                | Self::ToolUse { .. }
                | Self::ToolResult { .. }
                | Self::AssistantEnd
        )
    }
}

/// Frames sent from a client to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ClientFrame {
    /// User input for the session bound to the channel. The session id is
    /// redundant with the channel binding and is used for validation.
    UserMessage { session_id: String, content: String },
}

impl ClientFrame {
    pub fn user_message(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::UserMessage {
            session_id: session_id.into(),
            content: content.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.into()
    }

    pub const KINDS: [&'static str; 1] = ["user_message"];
}
