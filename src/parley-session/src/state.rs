//! Per-session presentation state.

use parley_protocol::Role;

use crate::message::{Message, MessageContent};
use crate::turn::Turn;

/// Ordered messages, the single active turn slot and the replay cursor of
/// one session.
#[derive(Debug, Clone)]
pub struct SessionState {
    session_id: String,
    messages: Vec<Message>,
    turn: Option<Turn>,
    next_ordinal: u64,
    history_expected: bool,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
            turn: None,
            next_ordinal: 0,
            history_expected: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn active_turn(&self) -> Option<&Turn> {
        self.turn.as_ref()
    }

    pub fn has_active_turn(&self) -> bool {
        self.turn.is_some()
    }

    /// Ordinal the next appended message receives.
    pub fn next_ordinal(&self) -> u64 {
        self.next_ordinal
    }

    /// Tool calls of the active turn still waiting for a result.
    pub fn pending_tool_calls(&self) -> usize {
        self.turn.as_ref().map_or(0, |turn| turn.pairing().len())
    }

    /// Whether a `history` frame is still acceptable on this connection.
    pub fn history_expected(&self) -> bool {
        self.history_expected
    }

    pub(crate) fn set_history_expected(&mut self, expected: bool) {
        self.history_expected = expected;
    }

    pub(crate) fn turn_mut(&mut self) -> Option<&mut Turn> {
        self.turn.as_mut()
    }

    pub(crate) fn start_turn(&mut self, turn: Turn) {
        self.turn = Some(turn);
    }

    pub(crate) fn take_turn(&mut self) -> Option<Turn> {
        self.turn.take()
    }

    pub(crate) fn append(&mut self, role: Role, content: MessageContent, failed: bool) -> &Message {
        let ordinal = self.next_ordinal;
        self.push(Message::new(ordinal, role, content, failed))
    }

    /// Appends a message whose ordinal was assigned elsewhere. The caller
    /// guarantees it is at least `next_ordinal`.
    pub(crate) fn push(&mut self, message: Message) -> &Message {
        debug_assert!(message.ordinal() >= self.next_ordinal);
        self.next_ordinal = message.ordinal() + 1;
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }

    /// Drops the active turn and its pairing entries. Returns the number of
    /// pending entries discarded, or `None` if no turn was active.
    pub fn end(&mut self) -> Option<usize> {
        self.history_expected = false;
        self.turn.take().map(|turn| turn.finalize().2)
    }
}
