//! Error types for session state transitions.

use thiserror::Error;

use crate::connection::ConnectionState;

/// An event that arrived out of protocol order and was ignored.
///
/// These never corrupt state and are never fatal; the aggregator reports them
/// so callers can log and count them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderingViolation {
    /// `assistant_start` while a turn is already active.
    #[error("assistant_start while a turn is already active")]
    TurnAlreadyActive,

    /// A turn event that needs an active turn arrived without one.
    #[error("{kind} without an active turn")]
    NoActiveTurn { kind: &'static str },

    /// `tool_use` reusing an id already seen in the active turn.
    #[error("duplicate tool call id `{id}` in the active turn")]
    DuplicateToolCall { id: String },

    /// `history` anywhere but first on a fresh connection.
    #[error("history frame is only valid first on a fresh connection")]
    HistoryOutOfPlace,
}

/// Invalid request to the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Channel is already connecting or connected.
    #[error("connection already open (state: {0})")]
    AlreadyOpen(ConnectionState),

    /// Reconnects are exhausted; only a manual retry can reopen.
    #[error("reconnect attempts exhausted; retry required")]
    Exhausted,

    /// `retry` outside of the exhausted state.
    #[error("retry is only valid after reconnects are exhausted (state: {0})")]
    NotExhausted(ConnectionState),
}

/// Why user input was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendRejected {
    #[error("input is disabled")]
    InputDisabled,

    #[error("message is empty")]
    Empty,
}
