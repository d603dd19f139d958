//! The in-progress assistant turn and its tool calls.

use parley_protocol::{ToolCallRecord, ToolCallStatus};
use serde_json::Value;

use crate::error::OrderingViolation;
use crate::pairing::{PairingTable, ToolCallHandle};

/// One tool invocation inside a turn.
///
/// Status only moves from `Running` to `Done` or `Error`, once.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    id: String,
    name: String,
    input: Value,
    status: ToolCallStatus,
    result: Option<Value>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
            status: ToolCallStatus::Running,
            result: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn status(&self) -> ToolCallStatus {
        self.status
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Merges a result. Returns `false` and leaves the call untouched if it is
    /// already resolved.
    pub fn resolve(&mut self, content: Value, is_error: bool) -> bool {
        if self.status.is_resolved() {
            return false;
        }
        self.status = ToolCallStatus::from_error_flag(is_error);
        self.result = Some(content);
        true
    }

    pub fn to_record(&self) -> ToolCallRecord {
        ToolCallRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            input: self.input.clone(),
            status: self.status,
            result: self.result.clone(),
        }
    }
}

impl From<ToolCallRecord> for ToolCall {
    fn from(record: ToolCallRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            input: record.input,
            status: record.status,
            result: record.result,
        }
    }
}

/// The mutable assistant response for the current exchange.
///
/// Owns the pairing table for its tool calls; the table is dropped with the
/// turn.
#[derive(Debug, Clone, Default)]
pub struct Turn {
    text: String,
    tool_calls: Vec<ToolCall>,
    pairing: PairingTable,
    implicit: bool,
}

impl Turn {
    pub fn new() -> Self {
        Self::default()
    }

    /// A turn opened by a `tool_use` that arrived without `assistant_start`.
    pub fn implicit() -> Self {
        Self {
            implicit: true,
            ..Self::default()
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    pub fn pairing(&self) -> &PairingTable {
        &self.pairing
    }

    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    pub fn push_text(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    /// Opens a running tool call and registers it for pairing.
    pub fn open_tool_call(
        &mut self,
        id: &str,
        name: &str,
        input: Value,
    ) -> Result<&ToolCall, OrderingViolation> {
        if self.tool_calls.iter().any(|call| call.id == id) {
            return Err(OrderingViolation::DuplicateToolCall { id: id.to_string() });
        }
        let handle = ToolCallHandle(self.tool_calls.len());
        self.pairing.register(id, handle);
        self.tool_calls.push(ToolCall::new(id, name, input));
        Ok(&self.tool_calls[handle.index()])
    }

    /// Pairs a result with its pending call. `None` means the id is not
    /// pending in this turn and the result is an orphan.
    pub fn resolve_tool_call(
        &mut self,
        id: &str,
        content: Value,
        is_error: bool,
    ) -> Option<&ToolCall> {
        let handle = self.pairing.take(id)?;
        let call = self.tool_calls.get_mut(handle.index())?;
        call.resolve(content, is_error).then_some(&*call)
    }

    /// Consumes the turn. Returns its text, its calls (unresolved ones stay
    /// `Running`) and how many pairing entries were still pending.
    pub fn finalize(mut self) -> (String, Vec<ToolCall>, usize) {
        let pending = self.pairing.discard();
        (self.text, self.tool_calls, pending)
    }
}
