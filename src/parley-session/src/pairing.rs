//! Tool-call pairing table.
//!
//! Maps an in-flight tool call id to the handle of its entry in the owning
//! turn, so a later `tool_result` is merged in O(1) regardless of how many
//! calls the turn holds. The table lives inside a [`Turn`](crate::Turn) and
//! is dropped wholesale when the turn finalizes; a late result then finds no
//! entry and becomes an orphan instead of touching a newer turn.

use std::collections::HashMap;

/// Position of a tool call inside its turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ToolCallHandle(pub(crate) usize);

impl ToolCallHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Pending tool calls of one turn, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct PairingTable {
    pending: HashMap<String, ToolCallHandle>,
}

impl PairingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending call. Returns `false` if the id is already pending.
    pub fn register(&mut self, id: impl Into<String>, handle: ToolCallHandle) -> bool {
        let id = id.into();
        if self.pending.contains_key(&id) {
            return false;
        }
        self.pending.insert(id, handle);
        true
    }

    /// Removes and returns the handle for `id`, if pending.
    pub fn take(&mut self, id: &str) -> Option<ToolCallHandle> {
        self.pending.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops every entry, returning how many were still pending.
    pub fn discard(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    /// Ids still waiting for a result, in no particular order.
    pub fn pending_ids(&self) -> impl Iterator<Item = &str> {
        self.pending.keys().map(String::as_str)
    }
}
