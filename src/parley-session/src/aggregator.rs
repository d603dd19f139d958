//! Turn aggregation.
//!
//! [`TurnAggregator::apply`] folds one decoded event into the session state
//! and notifies the projector. It is synchronous and never fails: events that
//! arrive out of order are logged and reported as [`Applied::Ignored`] without
//! touching state.

use parley_protocol::{HistoryMessage, Role, ServerEvent};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::OrderingViolation;
use crate::message::{Message, MessageContent};
use crate::projector::{NullProjector, Projector};
use crate::state::SessionState;
use crate::turn::Turn;

/// Effect of one event on the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// State changed.
    Updated,
    /// Ephemeral signal forwarded to the projector; state unchanged.
    Transient,
    /// Out-of-order event dropped; state unchanged.
    Ignored(OrderingViolation),
}

impl Applied {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored(_))
    }
}

#[derive(Debug, Clone)]
pub struct TurnAggregator {
    state: SessionState,
}

impl TurnAggregator {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            state: SessionState::new(session_id),
        }
    }

    /// Aggregator seeded with an already persisted history.
    pub fn restore(session_id: impl Into<String>, records: Vec<HistoryMessage>) -> Self {
        let mut aggregator = Self::new(session_id);
        aggregator.begin_connection();
        aggregator.apply(ServerEvent::History { messages: records }, &mut NullProjector);
        aggregator
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// A fresh connection is up; the next event may be `history`.
    pub fn begin_connection(&mut self) {
        self.state.set_history_expected(true);
    }

    /// Drops the active turn and its pairing entries.
    pub fn end(&mut self, projector: &mut dyn Projector) -> usize {
        match self.state.end() {
            Some(pending) => {
                projector.turn_discarded();
                pending
            }
            None => 0,
        }
    }

    pub fn apply(&mut self, event: ServerEvent, projector: &mut dyn Projector) -> Applied {
        let kind = event.kind();
        let history_expected = self.state.history_expected();
        // Status lines carry no session content and may precede the replay.
        if !matches!(event, ServerEvent::Status { .. }) {
            self.state.set_history_expected(false);
        }

        let applied = match event {
            ServerEvent::History { messages } if history_expected => {
                self.replay(messages, projector);
                Applied::Updated
            }
            ServerEvent::History { .. } => Applied::Ignored(OrderingViolation::HistoryOutOfPlace),
            ServerEvent::UserMessage { content } => {
                let message = self
                    .state
                    .append(Role::User, MessageContent::Text(content), false);
                projector.message_appended(message);
                Applied::Updated
            }
            ServerEvent::AssistantStart => {
                if self.state.has_active_turn() {
                    Applied::Ignored(OrderingViolation::TurnAlreadyActive)
                } else {
                    self.state.start_turn(Turn::new());
                    projector.turn_started();
                    Applied::Updated
                }
            }
            ServerEvent::AssistantChunk { content } => match self.state.turn_mut() {
                Some(turn) => {
                    turn.push_text(&content);
                    projector.turn_text(turn.text(), &content);
                    Applied::Updated
                }
                None => Applied::Ignored(OrderingViolation::NoActiveTurn { kind }),
            },
            ServerEvent::ToolUse { id, name, input } => self.tool_use(&id, &name, input, projector),
            ServerEvent::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => self.tool_result(tool_use_id, content, is_error, projector),
            ServerEvent::AssistantEnd => match self.state.take_turn() {
                Some(turn) => {
                    let (text, tool_calls, pending) = turn.finalize();
                    if pending > 0 {
                        warn!(
                            session_id = %self.state.session_id(),
                            pending,
                            "Turn finalized with unresolved tool calls"
                        );
                    }
                    let message = self.state.append(
                        Role::Assistant,
                        MessageContent::Turn { text, tool_calls },
                        false,
                    );
                    projector.turn_finalized(message);
                    Applied::Updated
                }
                None => Applied::Ignored(OrderingViolation::NoActiveTurn { kind }),
            },
            ServerEvent::Error { content } => {
                let message = self
                    .state
                    .append(Role::System, MessageContent::Text(content), true);
                projector.message_appended(message);
                Applied::Updated
            }
            ServerEvent::Status { content } => {
                projector.status(&content);
                Applied::Transient
            }
        };

        if let Applied::Ignored(violation) = &applied {
            warn!(
                session_id = %self.state.session_id(),
                kind,
                %violation,
                "Ignoring out-of-order event"
            );
        }
        applied
    }

    fn replay(&mut self, records: Vec<HistoryMessage>, projector: &mut dyn Projector) {
        if self.state.take_turn().is_some() {
            debug!(
                session_id = %self.state.session_id(),
                "Discarding interrupted turn before replay"
            );
            projector.turn_discarded();
        }

        let mut skipped = 0usize;
        for (position, record) in records.into_iter().enumerate() {
            let ordinal = record.ordinal.unwrap_or(position as u64);
            if ordinal < self.state.next_ordinal() {
                skipped += 1;
                continue;
            }
            let message = self.state.push(Message::from_history(ordinal, record));
            projector.message_appended(message);
        }

        debug!(
            session_id = %self.state.session_id(),
            skipped,
            total = self.state.messages().len(),
            "Replayed history"
        );
    }

    fn tool_use(
        &mut self,
        id: &str,
        name: &str,
        input: Value,
        projector: &mut dyn Projector,
    ) -> Applied {
        if !self.state.has_active_turn() {
            debug!(
                session_id = %self.state.session_id(),
                tool_use_id = %id,
                "tool_use without assistant_start, opening implicit turn"
            );
            self.state.start_turn(Turn::implicit());
            projector.turn_started();
        }
        let Some(turn) = self.state.turn_mut() else {
            return Applied::Ignored(OrderingViolation::NoActiveTurn { kind: "tool_use" });
        };
        match turn.open_tool_call(id, name, input) {
            Ok(call) => {
                projector.tool_call_opened(call);
                Applied::Updated
            }
            Err(violation) => Applied::Ignored(violation),
        }
    }

    fn tool_result(
        &mut self,
        tool_use_id: String,
        content: Value,
        is_error: bool,
        projector: &mut dyn Projector,
    ) -> Applied {
        let paired = self
            .state
            .turn_mut()
            .filter(|turn| turn.pairing().contains(&tool_use_id));
        if let Some(turn) = paired {
            if let Some(call) = turn.resolve_tool_call(&tool_use_id, content, is_error) {
                projector.tool_call_resolved(call);
            }
            return Applied::Updated;
        }

        debug!(
            session_id = %self.state.session_id(),
            tool_use_id = %tool_use_id,
            "Recording orphan tool result"
        );
        let message = self.state.append(
            Role::Assistant,
            MessageContent::OrphanResult {
                tool_use_id,
                content,
                is_error,
            },
            false,
        );
        projector.message_appended(message);
        Applied::Updated
    }
}

#[cfg(test)]
mod tests {
    use parley_protocol::ToolCallStatus;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::projector::{ProjectorEvent, RecordingProjector};

    fn aggregator() -> (TurnAggregator, RecordingProjector) {
        (TurnAggregator::new("s1"), RecordingProjector::new())
    }

    #[test]
    fn test_streamed_turn() {
        let (mut agg, mut proj) = aggregator();
        agg.apply(ServerEvent::UserMessage { content: "hi".into() }, &mut proj);
        agg.apply(ServerEvent::AssistantStart, &mut proj);
        agg.apply(ServerEvent::chunk("Hel"), &mut proj);
        agg.apply(ServerEvent::chunk("lo"), &mut proj);
        agg.apply(ServerEvent::AssistantEnd, &mut proj);

        let messages = agg.state().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text(), "Hello");
        assert_eq!(messages[1].ordinal(), 1);
        assert!(!agg.state().has_active_turn());

        assert_eq!(
            proj.events,
            vec![
                ProjectorEvent::MessageAppended {
                    ordinal: 0,
                    role: Role::User
                },
                ProjectorEvent::TurnStarted,
                ProjectorEvent::TurnText {
                    text: "Hel".into(),
                    delta: "Hel".into()
                },
                ProjectorEvent::TurnText {
                    text: "Hello".into(),
                    delta: "lo".into()
                },
                ProjectorEvent::TurnFinalized { ordinal: 1 },
            ]
        );
    }

    #[test]
    fn test_start_while_active_is_ignored() {
        let (mut agg, mut proj) = aggregator();
        agg.apply(ServerEvent::AssistantStart, &mut proj);
        agg.apply(ServerEvent::chunk("a"), &mut proj);

        assert_eq!(
            agg.apply(ServerEvent::AssistantStart, &mut proj),
            Applied::Ignored(OrderingViolation::TurnAlreadyActive)
        );
        assert_eq!(agg.state().active_turn().map(Turn::text), Some("a"));
    }

    #[test]
    fn test_chunk_and_end_without_turn_are_ignored() {
        let (mut agg, mut proj) = aggregator();
        assert_eq!(
            agg.apply(ServerEvent::chunk("x"), &mut proj),
            Applied::Ignored(OrderingViolation::NoActiveTurn {
                kind: "assistant_chunk"
            })
        );
        assert_eq!(
            agg.apply(ServerEvent::AssistantEnd, &mut proj),
            Applied::Ignored(OrderingViolation::NoActiveTurn {
                kind: "assistant_end"
            })
        );
        assert!(agg.state().messages().is_empty());
        assert!(proj.events.is_empty());
    }

    #[test]
    fn test_tool_use_opens_implicit_turn() {
        let (mut agg, mut proj) = aggregator();
        agg.apply(ServerEvent::tool_use("a", "read", json!({})), &mut proj);

        let turn = agg.state().active_turn().unwrap();
        assert!(turn.is_implicit());
        assert_eq!(turn.tool_calls().len(), 1);
        assert_eq!(
            proj.events,
            vec![
                ProjectorEvent::TurnStarted,
                ProjectorEvent::ToolCallOpened { id: "a".into() }
            ]
        );
    }

    #[test]
    fn test_duplicate_tool_use_is_ignored() {
        let (mut agg, mut proj) = aggregator();
        agg.apply(ServerEvent::AssistantStart, &mut proj);
        agg.apply(ServerEvent::tool_use("a", "read", json!({})), &mut proj);
        assert_eq!(
            agg.apply(ServerEvent::tool_use("a", "write", json!({})), &mut proj),
            Applied::Ignored(OrderingViolation::DuplicateToolCall { id: "a".into() })
        );
        assert_eq!(agg.state().active_turn().unwrap().tool_calls().len(), 1);
    }

    #[test]
    fn test_tool_result_pairs_with_call() {
        let (mut agg, mut proj) = aggregator();
        agg.apply(ServerEvent::AssistantStart, &mut proj);
        agg.apply(ServerEvent::tool_use("a", "read", json!({"path": "x"})), &mut proj);
        agg.apply(ServerEvent::tool_result("a", json!("contents"), false), &mut proj);

        let turn = agg.state().active_turn().unwrap();
        assert_eq!(turn.tool_calls()[0].status(), ToolCallStatus::Done);
        assert_eq!(turn.tool_calls()[0].result(), Some(&json!("contents")));
        assert!(turn.pairing().is_empty());
        assert_eq!(
            proj.events.last(),
            Some(&ProjectorEvent::ToolCallResolved {
                id: "a".into(),
                status: ToolCallStatus::Done
            })
        );
    }

    #[test]
    fn test_late_result_becomes_orphan() {
        let (mut agg, mut proj) = aggregator();
        agg.apply(ServerEvent::AssistantStart, &mut proj);
        agg.apply(ServerEvent::tool_use("a", "read", json!({})), &mut proj);
        agg.apply(ServerEvent::AssistantEnd, &mut proj);
        agg.apply(ServerEvent::AssistantStart, &mut proj);

        assert_eq!(
            agg.apply(ServerEvent::tool_result("a", json!("late"), true), &mut proj),
            Applied::Updated
        );

        let messages = agg.state().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].tool_calls()[0].status(), ToolCallStatus::Running);
        assert_eq!(
            messages[1].content(),
            &MessageContent::OrphanResult {
                tool_use_id: "a".into(),
                content: json!("late"),
                is_error: true,
            }
        );
        assert!(agg.state().active_turn().unwrap().tool_calls().is_empty());
    }

    #[test]
    fn test_error_is_a_failed_system_message() {
        let (mut agg, mut proj) = aggregator();
        agg.apply(ServerEvent::AssistantStart, &mut proj);
        agg.apply(ServerEvent::error("agent crashed"), &mut proj);

        let message = &agg.state().messages()[0];
        assert_eq!(message.role(), Role::System);
        assert!(message.is_failed());
        assert_eq!(message.text(), "agent crashed");
        assert!(agg.state().has_active_turn());
    }

    #[test]
    fn test_status_is_transient() {
        let (mut agg, mut proj) = aggregator();
        assert_eq!(
            agg.apply(ServerEvent::status("thinking"), &mut proj),
            Applied::Transient
        );
        assert!(agg.state().messages().is_empty());
        assert_eq!(proj.events, vec![ProjectorEvent::Status("thinking".into())]);
    }

    #[test]
    fn test_history_only_first_on_connection() {
        let (mut agg, mut proj) = aggregator();
        let history = || ServerEvent::History {
            messages: vec![HistoryMessage::text(Role::User, "hi")],
        };

        assert_eq!(
            agg.apply(history(), &mut proj),
            Applied::Ignored(OrderingViolation::HistoryOutOfPlace)
        );

        agg.begin_connection();
        assert_eq!(agg.apply(history(), &mut proj), Applied::Updated);
        assert_eq!(
            agg.apply(history(), &mut proj),
            Applied::Ignored(OrderingViolation::HistoryOutOfPlace)
        );
        assert_eq!(agg.state().messages().len(), 1);
    }

    #[test]
    fn test_status_before_history_keeps_replay() {
        let (mut agg, mut proj) = aggregator();
        agg.begin_connection();

        assert_eq!(
            agg.apply(ServerEvent::status("connected"), &mut proj),
            Applied::Transient
        );
        let history = ServerEvent::History {
            messages: vec![HistoryMessage::text(Role::User, "hi")],
        };
        assert_eq!(agg.apply(history, &mut proj), Applied::Updated);
        assert_eq!(agg.state().messages().len(), 1);

        agg.begin_connection();
        agg.apply(ServerEvent::error("boom"), &mut proj);
        let late = ServerEvent::History { messages: vec![] };
        assert_eq!(
            agg.apply(late, &mut proj),
            Applied::Ignored(OrderingViolation::HistoryOutOfPlace)
        );
    }

    #[test]
    fn test_replay_skips_known_ordinals() {
        let (mut agg, mut proj) = aggregator();
        agg.apply(ServerEvent::UserMessage { content: "hi".into() }, &mut proj);
        agg.apply(ServerEvent::AssistantStart, &mut proj);
        agg.apply(ServerEvent::chunk("par"), &mut proj);

        agg.begin_connection();
        agg.apply(
            ServerEvent::History {
                messages: vec![
                    HistoryMessage::text(Role::User, "hi").with_ordinal(0),
                    HistoryMessage::text(Role::Assistant, "partial answer").with_ordinal(1),
                ],
            },
            &mut proj,
        );

        let messages = agg.state().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text(), "partial answer");
        assert!(!agg.state().has_active_turn());
        assert!(proj.events.contains(&ProjectorEvent::TurnDiscarded));
    }

    #[test]
    fn test_restore_seeds_ordinals() {
        let agg = TurnAggregator::restore(
            "s1",
            vec![
                HistoryMessage::text(Role::User, "a"),
                HistoryMessage::text(Role::Assistant, "b"),
            ],
        );
        assert_eq!(agg.state().next_ordinal(), 2);
        assert!(!agg.state().history_expected());
    }

    #[test]
    fn test_end_discards_active_turn() {
        let (mut agg, mut proj) = aggregator();
        agg.apply(ServerEvent::tool_use("a", "read", json!({})), &mut proj);
        assert_eq!(agg.end(&mut proj), 1);
        assert_eq!(agg.state().pending_tool_calls(), 0);
        assert_eq!(agg.end(&mut proj), 0);
    }
}
