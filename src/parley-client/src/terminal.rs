//! Line-oriented terminal rendering.

use std::fmt;
use std::io::Write;

use parley_session::{
    ConnectionState, Message, MessageContent, Projector, Role, ToolCall, ToolCallStatus,
    value_text,
};

/// Renders a session onto any writer, typically stdout.
pub struct TerminalProjector<W: Write> {
    out: W,
    mid_line: bool,
}

impl<W: Write> TerminalProjector<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            mid_line: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, args: fmt::Arguments<'_>) {
        if self.mid_line {
            let _ = writeln!(self.out);
            self.mid_line = false;
        }
        let _ = writeln!(self.out, "{args}");
        let _ = self.out.flush();
    }

    fn partial(&mut self, text: &str) {
        let _ = write!(self.out, "{text}");
        let _ = self.out.flush();
        self.mid_line = true;
    }
}

fn status_label(status: ToolCallStatus) -> &'static str {
    match status {
        ToolCallStatus::Running => "running",
        ToolCallStatus::Done => "done",
        ToolCallStatus::Error => "failed",
    }
}

impl<W: Write> Projector for TerminalProjector<W> {
    fn message_appended(&mut self, message: &Message) {
        match (message.role(), message.content()) {
            (_, MessageContent::OrphanResult {
                tool_use_id,
                content,
                is_error,
            }) => {
                let label = if *is_error { "failed" } else { "result" };
                self.line(format_args!(
                    "  [tool {tool_use_id} {label}, no matching call] {}",
                    value_text(content)
                ));
            }
            (Role::System, _) if message.is_failed() => {
                self.line(format_args!("! {}", message.text()));
            }
            (Role::User, _) => self.line(format_args!("you> {}", message.text())),
            (Role::System, _) => self.line(format_args!("-- {}", message.text())),
            (Role::Assistant, _) => {
                self.line(format_args!("assistant> {}", message.text()));
                for call in message.tool_calls() {
                    self.line(format_args!(
                        "  [tool {} {}]",
                        call.name(),
                        status_label(call.status())
                    ));
                }
            }
        }
    }

    fn turn_started(&mut self) {
        self.line(format_args!(""));
        self.partial("assistant> ");
    }

    fn turn_text(&mut self, _text: &str, delta: &str) {
        self.partial(delta);
    }

    fn tool_call_opened(&mut self, call: &ToolCall) {
        self.line(format_args!("  [tool {} running]", call.name()));
    }

    fn tool_call_resolved(&mut self, call: &ToolCall) {
        let detail = call.result().map(value_text).unwrap_or_default();
        self.line(format_args!(
            "  [tool {} {}] {}",
            call.name(),
            status_label(call.status()),
            detail
        ));
    }

    fn input_enabled(&mut self, enabled: bool) {
        if enabled {
            self.line(format_args!("(ready)"));
        }
    }

    fn turn_finalized(&mut self, _message: &Message) {
        if self.mid_line {
            let _ = writeln!(self.out);
            let _ = self.out.flush();
            self.mid_line = false;
        }
    }

    fn turn_discarded(&mut self) {
        self.line(format_args!("  [interrupted]"));
    }

    fn status(&mut self, content: &str) {
        self.line(format_args!("-- {content}"));
    }

    fn connection_changed(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => self.line(format_args!("-- connected")),
            ConnectionState::ReconnectExhausted => {
                self.line(format_args!("-- disconnected (reconnect attempts exhausted)"))
            }
            ConnectionState::Connecting | ConnectionState::Disconnected => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_protocol::{HistoryMessage, ServerEvent};
    use parley_session::TurnAggregator;
    use serde_json::json;

    use super::*;

    fn render(events: Vec<ServerEvent>) -> String {
        let mut aggregator = TurnAggregator::new("s");
        let mut projector = TerminalProjector::new(Vec::new());
        for event in events {
            aggregator.apply(event, &mut projector);
        }
        String::from_utf8(projector.into_inner()).unwrap()
    }

    #[test]
    fn test_streams_turn_on_one_line() {
        let out = render(vec![
            ServerEvent::UserMessage {
                content: "hi".into(),
            },
            ServerEvent::AssistantStart,
            ServerEvent::chunk("Hel"),
            ServerEvent::chunk("lo"),
            ServerEvent::AssistantEnd,
        ]);
        assert_eq!(out, "you> hi\n\nassistant> Hello\n");
    }

    #[test]
    fn test_tool_calls_and_orphans() {
        let out = render(vec![
            ServerEvent::tool_use("a", "read", json!({})),
            ServerEvent::tool_result("a", json!("3 lines"), false),
            ServerEvent::tool_result("zz", json!("late"), true),
            ServerEvent::AssistantEnd,
        ]);
        assert!(out.contains("[tool read running]"));
        assert!(out.contains("[tool read done] 3 lines"));
        assert!(out.contains("[tool zz failed, no matching call] late"));
    }

    #[test]
    fn test_failed_system_message() {
        let out = render(vec![ServerEvent::error("agent unavailable")]);
        assert_eq!(out, "! agent unavailable\n");
    }

    #[test]
    fn test_replayed_history() {
        let mut aggregator = TurnAggregator::new("s");
        aggregator.begin_connection();
        let mut projector = TerminalProjector::new(Vec::new());
        aggregator.apply(
            ServerEvent::History {
                messages: vec![
                    HistoryMessage::text(Role::User, "hi"),
                    HistoryMessage::text(Role::Assistant, "hello"),
                ],
            },
            &mut projector,
        );
        let out = String::from_utf8(projector.into_inner()).unwrap();
        assert_eq!(out, "you> hi\nassistant> hello\n");
    }
}
