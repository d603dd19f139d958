//! The owned per-session object.

use parley_protocol::{ClientFrame, DecodeError, ServerEvent, decode_server_event};
use tracing::{info, warn};

use crate::aggregator::{Applied, TurnAggregator};
use crate::connection::{
    ConnectionManager, ConnectionState, LossOutcome, ReconnectPolicy, ReconnectTimer,
};
use crate::error::{ConnectionError, SendRejected};
use crate::projector::{InputGate, Projector};
use crate::state::SessionState;

/// One chat session as seen by a client: the aggregated state, the
/// connection lifecycle and the input gate.
///
/// Sessions share nothing; each owns its state outright and is driven by a
/// single caller in arrival order.
#[derive(Debug, Clone)]
pub struct ChatSession {
    aggregator: TurnAggregator,
    connection: ConnectionManager,
    gate: InputGate,
}

impl ChatSession {
    pub fn new(session_id: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            aggregator: TurnAggregator::new(session_id),
            connection: ConnectionManager::new(policy),
            gate: InputGate::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        self.aggregator.state().session_id()
    }

    pub fn state(&self) -> &SessionState {
        self.aggregator.state()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn input_enabled(&self) -> bool {
        self.gate.enabled()
    }

    /// Starts the first connection attempt.
    pub fn open(&mut self, projector: &mut dyn Projector) -> Result<u64, ConnectionError> {
        let generation = self.connection.open()?;
        projector.connection_changed(self.connection.state());
        self.gate.sync(projector);
        Ok(generation)
    }

    /// Transport for `generation` is up. Returns `false` if it was superseded.
    pub fn transport_connected(&mut self, generation: u64, projector: &mut dyn Projector) -> bool {
        if !self.connection.connected(generation) {
            return false;
        }
        info!(session_id = %self.session_id(), generation, "Session connected");
        self.aggregator.begin_connection();
        self.gate.set_connected(true);
        projector.connection_changed(ConnectionState::Connected);
        self.gate.sync(projector);
        true
    }

    /// Transport for `generation` failed or dropped.
    pub fn transport_lost(
        &mut self,
        generation: u64,
        projector: &mut dyn Projector,
    ) -> LossOutcome {
        let outcome = self.connection.lost(generation);
        if outcome != LossOutcome::Stale {
            self.gate.set_connected(false);
            projector.connection_changed(self.connection.state());
            self.gate.sync(projector);
        }
        outcome
    }

    /// A reconnect timer expired. Returns the generation to connect with.
    pub fn timer_fired(
        &mut self,
        timer: ReconnectTimer,
        projector: &mut dyn Projector,
    ) -> Option<u64> {
        let generation = self.connection.timer_fired(timer)?;
        projector.connection_changed(self.connection.state());
        Some(generation)
    }

    /// Manual reopen after reconnects were exhausted.
    pub fn retry(&mut self, projector: &mut dyn Projector) -> Result<u64, ConnectionError> {
        let generation = self.connection.retry()?;
        info!(session_id = %self.session_id(), "Manual reconnect requested");
        projector.connection_changed(self.connection.state());
        Ok(generation)
    }

    /// Folds one decoded event.
    pub fn receive(&mut self, event: ServerEvent, projector: &mut dyn Projector) -> Applied {
        let is_error = matches!(event, ServerEvent::Error { .. });
        let had_turn = self.aggregator.state().has_active_turn();
        let applied = self.aggregator.apply(event, projector);

        let has_turn = self.aggregator.state().has_active_turn();
        if is_error && applied == Applied::Updated {
            self.gate.error_received();
        } else if has_turn && !had_turn {
            self.gate.turn_started();
        }
        self.gate.set_turn_active(has_turn);
        self.gate.sync(projector);
        applied
    }

    /// Decodes and folds one raw frame. A frame that does not decode is
    /// logged and dropped; state is untouched.
    pub fn receive_frame(
        &mut self,
        text: &str,
        projector: &mut dyn Projector,
    ) -> Result<Applied, DecodeError> {
        match decode_server_event(text) {
            Ok(event) => Ok(self.receive(event, projector)),
            Err(err) => {
                warn!(
                    session_id = %self.session_id(),
                    reason = err.label(),
                    error = %err,
                    "Dropping undecodable frame"
                );
                Err(err)
            }
        }
    }

    /// Validates user input and builds the outbound frame. Input is disabled
    /// until the reply starts.
    pub fn prepare_send(
        &mut self,
        text: &str,
        projector: &mut dyn Projector,
    ) -> Result<ClientFrame, SendRejected> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SendRejected::Empty);
        }
        if !self.gate.enabled() {
            return Err(SendRejected::InputDisabled);
        }
        self.gate.message_sent();
        self.gate.sync(projector);
        Ok(ClientFrame::user_message(self.session_id(), text))
    }

    /// Local teardown after the session was ended: drops the active turn and
    /// its pairing entries and closes the connection for good.
    pub fn end(&mut self, projector: &mut dyn Projector) -> usize {
        let discarded = self.aggregator.end(projector);
        self.connection.close();
        self.gate.reset();
        projector.connection_changed(self.connection.state());
        self.gate.sync(projector);
        info!(session_id = %self.session_id(), discarded, "Session ended");
        discarded
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::projector::{ProjectorEvent, RecordingProjector};

    fn connected() -> (ChatSession, RecordingProjector) {
        let mut session = ChatSession::new("s1", ReconnectPolicy::default());
        let mut proj = RecordingProjector::new();
        let generation = session.open(&mut proj).unwrap();
        assert!(session.transport_connected(generation, &mut proj));
        proj.take();
        (session, proj)
    }

    #[test]
    fn test_input_follows_connection() {
        let mut session = ChatSession::new("s1", ReconnectPolicy::default());
        let mut proj = RecordingProjector::new();
        let generation = session.open(&mut proj).unwrap();
        assert!(!session.input_enabled());

        session.transport_connected(generation, &mut proj);
        assert!(session.input_enabled());

        session.transport_lost(generation, &mut proj);
        assert!(!session.input_enabled());
        assert_eq!(proj.input_enabled_state(), Some(false));
    }

    #[test]
    fn test_send_disables_input_until_turn_ends() {
        let (mut session, mut proj) = connected();
        let frame = session.prepare_send("  hello ", &mut proj).unwrap();
        assert_eq!(frame, ClientFrame::user_message("s1", "hello"));
        assert!(!session.input_enabled());
        assert_eq!(
            session.prepare_send("again", &mut proj),
            Err(SendRejected::InputDisabled)
        );

        session.receive(ServerEvent::UserMessage { content: "hello".into() }, &mut proj);
        session.receive(ServerEvent::AssistantStart, &mut proj);
        assert!(!session.input_enabled());
        session.receive(ServerEvent::AssistantEnd, &mut proj);
        assert!(session.input_enabled());
    }

    #[test]
    fn test_empty_send_is_rejected() {
        let (mut session, mut proj) = connected();
        assert_eq!(session.prepare_send("   ", &mut proj), Err(SendRejected::Empty));
        assert!(session.input_enabled());
    }

    #[test]
    fn test_error_reenables_input() {
        let (mut session, mut proj) = connected();
        session.prepare_send("hello", &mut proj).unwrap();
        session.receive(ServerEvent::AssistantStart, &mut proj);
        session.receive(ServerEvent::error("bridge failed"), &mut proj);

        assert!(session.input_enabled());
        assert_eq!(proj.input_enabled_state(), Some(true));
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let (mut session, mut proj) = connected();
        assert!(session.receive_frame("{not json", &mut proj).is_err());
        assert!(session.receive_frame(r#"{"type":"bogus"}"#, &mut proj).is_err());
        assert!(proj.events.is_empty());
        assert_eq!(session.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn test_end_tears_down() {
        let (mut session, mut proj) = connected();
        session
            .receive_frame(r#"{"type":"tool_use","id":"a","name":"read"}"#, &mut proj)
            .unwrap();

        assert_eq!(session.end(&mut proj), 1);
        assert!(!session.state().has_active_turn());
        assert!(session.connection().is_closed());
        assert!(!session.input_enabled());
        assert!(proj.events.contains(&ProjectorEvent::TurnDiscarded));
    }
}
