//! Finalized messages of a session.

use parley_protocol::{HistoryMessage, Role, ToolCallRecord, ToolCallStatus};
use serde_json::Value;

use crate::turn::ToolCall;

/// Body of a finalized message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    /// Plain text.
    Text(String),
    /// A finalized assistant turn.
    Turn {
        text: String,
        tool_calls: Vec<ToolCall>,
    },
    /// A tool result that matched no pending call.
    OrphanResult {
        tool_use_id: String,
        content: Value,
        is_error: bool,
    },
}

/// An immutable entry in a session's ordered history.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    ordinal: u64,
    role: Role,
    content: MessageContent,
    failed: bool,
}

impl Message {
    pub(crate) fn new(ordinal: u64, role: Role, content: MessageContent, failed: bool) -> Self {
        Self {
            ordinal,
            role,
            content,
            failed,
        }
    }

    /// Rebuilds a message from a replayed history record.
    pub(crate) fn from_history(ordinal: u64, record: HistoryMessage) -> Self {
        let content = match record.orphan_of {
            Some(tool_use_id) => {
                let (content, is_error) = match record.tool_calls.into_iter().next() {
                    Some(call) => (
                        call.result.unwrap_or(Value::Null),
                        call.status == ToolCallStatus::Error,
                    ),
                    None => (Value::String(record.content), false),
                };
                MessageContent::OrphanResult {
                    tool_use_id,
                    content,
                    is_error,
                }
            }
            None if record.tool_calls.is_empty() => MessageContent::Text(record.content),
            None => MessageContent::Turn {
                text: record.content,
                tool_calls: record.tool_calls.into_iter().map(ToolCall::from).collect(),
            },
        };
        Self::new(ordinal, record.role, content, record.failed)
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &MessageContent {
        &self.content
    }

    /// Set for session-level failures.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Text of the message. Orphan results render their content.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) | MessageContent::Turn { text, .. } => text.clone(),
            MessageContent::OrphanResult { content, .. } => value_text(content),
        }
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        match &self.content {
            MessageContent::Turn { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    /// The durable record of this message.
    pub fn to_history(&self) -> HistoryMessage {
        let mut record = HistoryMessage::text(self.role, self.text()).with_ordinal(self.ordinal);
        record.failed = self.failed;
        match &self.content {
            MessageContent::Text(_) => {}
            MessageContent::Turn { tool_calls, .. } => {
                record.tool_calls = tool_calls.iter().map(ToolCall::to_record).collect();
            }
            MessageContent::OrphanResult {
                tool_use_id,
                content,
                is_error,
            } => {
                record.orphan_of = Some(tool_use_id.clone());
                record.tool_calls = vec![ToolCallRecord {
                    id: tool_use_id.clone(),
                    name: String::new(),
                    input: Value::Object(Default::default()),
                    status: ToolCallStatus::from_error_flag(*is_error),
                    result: Some(content.clone()),
                }];
            }
        }
        record
    }
}

/// Display text of a JSON payload; strings are shown without quotes.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
