//! Presentation projector contract.
//!
//! A projector is a pure sink: the session calls it after each state change
//! and never reads anything back. Rendering surfaces, stores and tests all
//! implement the same trait.

use crate::connection::ConnectionState;
use crate::message::Message;
use crate::turn::ToolCall;
use parley_protocol::{Role, ToolCallStatus};

pub trait Projector {
    /// A finalized message was appended at the end of the history.
    fn message_appended(&mut self, message: &Message);

    /// A new active turn began.
    fn turn_started(&mut self);

    /// The active turn's text grew by `delta`; `text` is the full text so far.
    fn turn_text(&mut self, text: &str, delta: &str);

    /// A tool call opened in the active turn.
    fn tool_call_opened(&mut self, call: &ToolCall);

    /// A pending tool call moved to `done` or `error`.
    fn tool_call_resolved(&mut self, call: &ToolCall);

    /// Input was disengaged or re-engaged.
    fn input_enabled(&mut self, enabled: bool);

    /// The active turn was finalized into `message`.
    fn turn_finalized(&mut self, message: &Message) {
        self.message_appended(message);
    }

    /// The active turn was dropped without being finalized.
    fn turn_discarded(&mut self) {}

    /// Ephemeral informational signal.
    fn status(&mut self, _content: &str) {}

    fn connection_changed(&mut self, _state: ConnectionState) {}
}

/// Projector that renders nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProjector;

impl Projector for NullProjector {
    fn message_appended(&mut self, _message: &Message) {}
    fn turn_started(&mut self) {}
    fn turn_text(&mut self, _text: &str, _delta: &str) {}
    fn tool_call_opened(&mut self, _call: &ToolCall) {}
    fn tool_call_resolved(&mut self, _call: &ToolCall) {}
    fn input_enabled(&mut self, _enabled: bool) {}
}

/// One projector callback, as captured by [`RecordingProjector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectorEvent {
    MessageAppended { ordinal: u64, role: Role },
    TurnStarted,
    TurnText { text: String, delta: String },
    ToolCallOpened { id: String },
    ToolCallResolved { id: String, status: ToolCallStatus },
    InputEnabled(bool),
    TurnFinalized { ordinal: u64 },
    TurnDiscarded,
    Status(String),
    ConnectionChanged(ConnectionState),
}

/// Projector that records every callback in order.
#[derive(Debug, Default, Clone)]
pub struct RecordingProjector {
    pub events: Vec<ProjectorEvent>,
}

impl RecordingProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last input state reported, if any.
    pub fn input_enabled_state(&self) -> Option<bool> {
        self.events.iter().rev().find_map(|event| match event {
            ProjectorEvent::InputEnabled(enabled) => Some(*enabled),
            _ => None,
        })
    }

    pub fn take(&mut self) -> Vec<ProjectorEvent> {
        std::mem::take(&mut self.events)
    }
}

impl Projector for RecordingProjector {
    fn message_appended(&mut self, message: &Message) {
        self.events.push(ProjectorEvent::MessageAppended {
            ordinal: message.ordinal(),
            role: message.role(),
        });
    }

    fn turn_started(&mut self) {
        self.events.push(ProjectorEvent::TurnStarted);
    }

    fn turn_text(&mut self, text: &str, delta: &str) {
        self.events.push(ProjectorEvent::TurnText {
            text: text.to_string(),
            delta: delta.to_string(),
        });
    }

    fn tool_call_opened(&mut self, call: &ToolCall) {
        self.events.push(ProjectorEvent::ToolCallOpened {
            id: call.id().to_string(),
        });
    }

    fn tool_call_resolved(&mut self, call: &ToolCall) {
        self.events.push(ProjectorEvent::ToolCallResolved {
            id: call.id().to_string(),
            status: call.status(),
        });
    }

    fn input_enabled(&mut self, enabled: bool) {
        self.events.push(ProjectorEvent::InputEnabled(enabled));
    }

    fn turn_finalized(&mut self, message: &Message) {
        self.events.push(ProjectorEvent::TurnFinalized {
            ordinal: message.ordinal(),
        });
    }

    fn turn_discarded(&mut self) {
        self.events.push(ProjectorEvent::TurnDiscarded);
    }

    fn status(&mut self, content: &str) {
        self.events.push(ProjectorEvent::Status(content.to_string()));
    }

    fn connection_changed(&mut self, state: ConnectionState) {
        self.events.push(ProjectorEvent::ConnectionChanged(state));
    }
}

/// Decides whether user input is accepted.
///
/// Enabled while connected with no active turn and no reply pending. An
/// `error` event forces it on until the next send or turn start.
#[derive(Debug, Default, Clone)]
pub struct InputGate {
    connected: bool,
    turn_active: bool,
    awaiting_reply: bool,
    error_override: bool,
    reported: Option<bool>,
}

impl InputGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(&self) -> bool {
        self.connected && (self.error_override || (!self.turn_active && !self.awaiting_reply))
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        if !connected {
            self.awaiting_reply = false;
        }
    }

    pub fn set_turn_active(&mut self, active: bool) {
        self.turn_active = active;
    }

    pub fn turn_started(&mut self) {
        self.turn_active = true;
        self.awaiting_reply = false;
        self.error_override = false;
    }

    pub fn message_sent(&mut self) {
        self.awaiting_reply = true;
        self.error_override = false;
    }

    pub fn error_received(&mut self) {
        self.awaiting_reply = false;
        self.error_override = true;
    }

    pub fn reset(&mut self) {
        let reported = self.reported;
        *self = Self {
            reported,
            ..Self::default()
        };
    }

    /// Reports the current state to `projector` if it changed since the last
    /// report.
    pub fn sync(&mut self, projector: &mut dyn Projector) {
        let enabled = self.enabled();
        if self.reported != Some(enabled) {
            self.reported = Some(enabled);
            projector.input_enabled(enabled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_requires_connection() {
        let mut gate = InputGate::new();
        assert!(!gate.enabled());
        gate.set_connected(true);
        assert!(gate.enabled());
    }

    #[test]
    fn test_gate_closed_during_turn() {
        let mut gate = InputGate::new();
        gate.set_connected(true);
        gate.message_sent();
        assert!(!gate.enabled());

        gate.turn_started();
        assert!(!gate.enabled());

        gate.set_turn_active(false);
        assert!(gate.enabled());
    }

    #[test]
    fn test_error_reenables_input_mid_turn() {
        let mut gate = InputGate::new();
        gate.set_connected(true);
        gate.turn_started();
        gate.error_received();
        assert!(gate.enabled());

        gate.message_sent();
        assert!(!gate.enabled());
    }

    #[test]
    fn test_error_does_not_override_disconnect() {
        let mut gate = InputGate::new();
        gate.error_received();
        assert!(!gate.enabled());
    }

    #[test]
    fn test_sync_reports_changes_only() {
        let mut gate = InputGate::new();
        let mut projector = RecordingProjector::new();

        gate.sync(&mut projector);
        gate.sync(&mut projector);
        gate.set_connected(true);
        gate.sync(&mut projector);

        assert_eq!(
            projector.events,
            vec![
                ProjectorEvent::InputEnabled(false),
                ProjectorEvent::InputEnabled(true)
            ]
        );
        assert_eq!(projector.input_enabled_state(), Some(true));
    }
}
