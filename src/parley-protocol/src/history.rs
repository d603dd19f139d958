//! Durable message records replayed to a client on connect.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::Display;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Resolution state of a tool call.
///
/// The only legal transitions are `Running -> Done` and `Running -> Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolCallStatus {
    #[default]
    Running,
    Done,
    Error,
}

impl ToolCallStatus {
    /// Whether the call has been resolved.
    pub fn is_resolved(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Status a result with the given error flag resolves to.
    pub fn from_error_flag(is_error: bool) -> Self {
        if is_error { Self::Error } else { Self::Done }
    }
}

/// A tool call as it was persisted with its assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    #[serde(default = "empty_object")]
    pub input: Value,
    #[serde(default)]
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// One finalized message of a session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    /// Position in the durable history. Older stores may omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<u64>,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    /// Set for session-level failures recorded as system messages.
    #[serde(default, skip_serializing_if = "is_false")]
    pub failed: bool,
    /// Originating tool call id when this entry is an unpaired tool result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orphan_of: Option<String>,
}

impl HistoryMessage {
    /// Plain text message without ordinal.
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            ordinal: None,
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            failed: false,
            orphan_of: None,
        }
    }

    /// Sets the ordinal.
    pub fn with_ordinal(mut self, ordinal: u64) -> Self {
        self.ordinal = Some(ordinal);
        self
    }

    /// Attaches tool call records.
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCallRecord>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

pub(crate) fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn is_false(value: &bool) -> bool {
    !*value
}
