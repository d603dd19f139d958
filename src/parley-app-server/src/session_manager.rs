//! Live session registry and turn runner.
//!
//! Every live session folds the events it emits through its own
//! [`TurnAggregator`] before forwarding them, with a projector that appends
//! finalized messages to the store. What is persisted is therefore exactly
//! what a connected client assembles from the same stream.

use std::collections::HashMap;
use std::sync::Arc;

use parley_protocol::{ClientFrame, HistoryMessage, ServerEvent};
use parley_session::{Message, NullProjector, Projector, ToolCall, TurnAggregator};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bridge::{AgentBridge, BridgeEvent, TurnRequest};
use crate::storage::{SessionStorage, StorageError, StoredSession};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Session has ended: {0}")]
    Ended(String),

    #[error("A turn is already in progress")]
    TurnInProgress,

    #[error("Message addressed to session {got}, channel is bound to {expected}")]
    Mismatch { expected: String, got: String },

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Session {0} could not be saved and was closed; reconnect to reload it")]
    Unavailable(String),
}

/// Persists finalized messages as the aggregator produces them. The first
/// failure is kept so the caller can stop the session.
struct StoreProjector<'a> {
    storage: &'a SessionStorage,
    session_id: &'a str,
    failure: Option<StorageError>,
}

impl Projector for StoreProjector<'_> {
    fn message_appended(&mut self, message: &Message) {
        if self.failure.is_some() {
            return;
        }
        if let Err(e) = self
            .storage
            .append_message(self.session_id, &message.to_history())
        {
            error!(
                session_id = %self.session_id,
                ordinal = message.ordinal(),
                error = %e,
                "Failed to persist message"
            );
            self.failure = Some(e);
        }
    }

    fn turn_started(&mut self) {}

    fn turn_text(&mut self, _text: &str, _delta: &str) {}

    fn tool_call_opened(&mut self, _call: &ToolCall) {}

    fn tool_call_resolved(&mut self, _call: &ToolCall) {}

    fn input_enabled(&mut self, _enabled: bool) {}
}

struct LiveInner {
    aggregator: TurnAggregator,
    /// Events of the turn in flight, replayed to clients that attach mid-turn.
    in_flight: Vec<ServerEvent>,
    senders: Vec<mpsc::Sender<ServerEvent>>,
    runner: Option<JoinHandle<()>>,
    ended: bool,
    /// Set once the store rejected a write; memory is ahead of disk.
    failed: bool,
}

impl LiveInner {
    /// Whether `event` is part of the turn a late client must rebuild.
    /// A tool result that will not pair is persisted as an orphan message
    /// and reaches late clients through history instead.
    fn belongs_to_turn(&self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::ToolResult { tool_use_id, .. } => self
                .aggregator
                .state()
                .active_turn()
                .is_some_and(|turn| turn.pairing().contains(tool_use_id)),
            other => other.is_turn_event(),
        }
    }

    /// Adds a turn event to the replay buffer, folding consecutive chunks.
    fn buffer(&mut self, event: &ServerEvent) {
        if let (
            ServerEvent::AssistantChunk { content },
            Some(ServerEvent::AssistantChunk { content: buffered }),
        ) = (event, self.in_flight.last_mut())
        {
            buffered.push_str(content);
            return;
        }
        self.in_flight.push(event.clone());
    }
}

/// One session with its state held in memory.
pub struct LiveSession {
    id: String,
    storage: Arc<SessionStorage>,
    inner: Mutex<LiveInner>,
}

impl LiveSession {
    fn restore(id: &str, storage: Arc<SessionStorage>, history: Vec<HistoryMessage>) -> Self {
        let aggregator = TurnAggregator::restore(id, history);
        debug!(
            session_id = %id,
            messages = aggregator.state().messages().len(),
            "Restored session"
        );
        Self {
            id: id.to_string(),
            storage,
            inner: Mutex::new(LiveInner {
                aggregator,
                in_flight: Vec::new(),
                senders: Vec::new(),
                runner: None,
                ended: false,
                failed: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Refuses work once the session was ended or could not be saved.
    fn check_open(&self, inner: &LiveInner) -> Result<(), SessionError> {
        if inner.ended {
            Err(SessionError::Ended(self.id.clone()))
        } else if inner.failed {
            Err(SessionError::Unavailable(self.id.clone()))
        } else {
            Ok(())
        }
    }

    /// Folds, persists and forwards one event. Never waits on a client: a
    /// subscriber whose queue is full is disconnected and resyncs through
    /// history when it reconnects.
    fn publish(&self, inner: &mut LiveInner, event: ServerEvent) -> Result<(), SessionError> {
        self.check_open(inner)?;
        let buffered = inner.belongs_to_turn(&event);
        let mut projector = StoreProjector {
            storage: &self.storage,
            session_id: &self.id,
            failure: None,
        };
        let applied = inner.aggregator.apply(event.clone(), &mut projector);
        if let Some(failure) = projector.failure {
            return Err(self.fail(inner, failure));
        }
        if applied.is_ignored() {
            return Ok(());
        }

        match &event {
            ServerEvent::AssistantEnd => inner.in_flight.clear(),
            turn_event if buffered => inner.buffer(turn_event),
            _ => {}
        }
        self.deliver(inner, &event);
        Ok(())
    }

    fn deliver(&self, inner: &mut LiveInner, event: &ServerEvent) {
        let session_id = &self.id;
        inner
            .senders
            .retain(|sender| match sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(%session_id, "Client is not keeping up, disconnecting it");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(%session_id, "Dropped closed client channel");
                    false
                }
            });
    }

    /// Stops the session after a failed write. Clients are told, then
    /// disconnected; the next lookup reloads what the store holds.
    fn fail(&self, inner: &mut LiveInner, failure: StorageError) -> SessionError {
        error!(
            session_id = %self.id,
            error = %failure,
            "Session store failed, closing live session"
        );
        inner.failed = true;
        inner.in_flight.clear();
        let error = SessionError::Unavailable(self.id.clone());
        self.deliver(inner, &ServerEvent::error(error.to_string()));
        inner.senders.clear();
        error
    }

    async fn emit(&self, event: ServerEvent) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        self.publish(&mut inner, event)
    }

    /// Queues history and the in-flight turn, then subscribes `sender`.
    async fn attach(&self, sender: &mpsc::Sender<ServerEvent>) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        self.check_open(&inner)?;

        let messages = inner
            .aggregator
            .state()
            .messages()
            .iter()
            .map(Message::to_history)
            .collect();
        let mut replay = vec![ServerEvent::History { messages }];
        replay.extend(inner.in_flight.iter().cloned());
        let in_flight = replay.len() - 1;

        for event in replay {
            if let Err(e) = sender.try_send(event) {
                debug!(session_id = %self.id, error = %e, "Client channel rejected replay");
                return Ok(());
            }
        }
        inner.senders.push(sender.clone());
        info!(
            session_id = %self.id,
            in_flight,
            clients = inner.senders.len(),
            "Client attached"
        );
        Ok(())
    }

    async fn detach_closed(&self) {
        let mut inner = self.inner.lock().await;
        inner.senders.retain(|sender| !sender.is_closed());
    }

    /// Records a rejected input as a session-level error so every client,
    /// and the store, sees the same message sequence.
    fn reject(&self, inner: &mut LiveInner, error: SessionError) -> SessionError {
        debug!(session_id = %self.id, %error, "Rejecting user message");
        match self.publish(inner, ServerEvent::error(error.to_string())) {
            Ok(()) => error,
            Err(unavailable) => unavailable,
        }
    }

    async fn submit(
        self: &Arc<Self>,
        bridge: Arc<dyn AgentBridge>,
        content: &str,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        self.check_open(&inner)?;
        let content = content.trim();
        if content.is_empty() {
            return Err(self.reject(&mut inner, SessionError::EmptyMessage));
        }
        if inner.runner.is_some() || inner.aggregator.state().has_active_turn() {
            return Err(self.reject(&mut inner, SessionError::TurnInProgress));
        }

        if let Err(e) = self.storage.touch(&self.id) {
            warn!(session_id = %self.id, error = %e, "Failed to touch session");
        }

        let history = inner
            .aggregator
            .state()
            .messages()
            .iter()
            .map(Message::to_history)
            .collect();
        self.publish(
            &mut inner,
            ServerEvent::UserMessage {
                content: content.to_string(),
            },
        )?;

        let request = TurnRequest {
            session_id: self.id.clone(),
            content: content.to_string(),
            history,
        };
        let session = Arc::clone(self);
        inner.runner = Some(tokio::spawn(async move {
            session.run_turn(bridge, request).await;
        }));
        Ok(())
    }

    /// Wraps one bridge turn in `assistant_start` … `assistant_end`. The turn
    /// is closed even when the bridge fails; the failure follows as an
    /// `error` event. A session that stops accepting events drops the bridge
    /// sink, which ends the bridge turn.
    async fn run_turn(&self, bridge: Arc<dyn AgentBridge>, request: TurnRequest) {
        let (tx, mut rx) = mpsc::channel::<BridgeEvent>(64);
        if self.emit(ServerEvent::AssistantStart).await.is_err() {
            self.inner.lock().await.runner = None;
            return;
        }

        let forward = async {
            while let Some(event) = rx.recv().await {
                if self.emit(event.into()).await.is_err() {
                    break;
                }
            }
        };
        let (result, ()) = tokio::join!(bridge.run_turn(request, tx), forward);

        let mut inner = self.inner.lock().await;
        let closed = self.publish(&mut inner, ServerEvent::AssistantEnd);
        if let (Ok(()), Err(e)) = (closed, result) {
            warn!(session_id = %self.id, error = %e, "Agent turn failed");
            // A store failure here already closed the session.
            let _ = self.publish(&mut inner, ServerEvent::error(e.to_string()));
        }
        inner.runner = None;
    }

    /// Stops the runner, drops the active turn and closes every client
    /// channel. Returns the number of tool calls left pending.
    async fn end(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.ended = true;
        if let Some(runner) = inner.runner.take() {
            runner.abort();
        }
        inner.in_flight.clear();
        inner.senders.clear();
        inner.aggregator.end(&mut NullProjector)
    }

    async fn is_idle(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.runner.is_none() && inner.senders.iter().all(|sender| sender.is_closed())
    }

    async fn has_failed(&self) -> bool {
        self.inner.lock().await.failed
    }

    /// Finalized messages as currently held in memory.
    pub async fn messages(&self) -> Vec<HistoryMessage> {
        let inner = self.inner.lock().await;
        inner
            .aggregator
            .state()
            .messages()
            .iter()
            .map(Message::to_history)
            .collect()
    }

    pub async fn turn_running(&self) -> bool {
        self.inner.lock().await.runner.is_some()
    }
}

/// Registry of live sessions.
pub struct SessionManager {
    storage: Arc<SessionStorage>,
    bridge: Arc<dyn AgentBridge>,
    sessions: RwLock<HashMap<String, Arc<LiveSession>>>,
}

impl SessionManager {
    pub fn new(storage: Arc<SessionStorage>, bridge: Arc<dyn AgentBridge>) -> Self {
        Self {
            storage,
            bridge,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<SessionStorage> {
        &self.storage
    }

    /// The live session for `id`, loading it from the store if needed. A
    /// session closed by a store failure is replaced by a fresh load.
    pub async fn live(&self, id: &str) -> Result<Arc<LiveSession>, SessionError> {
        let cached = self.sessions.read().await.get(id).cloned();
        if let Some(session) = cached {
            if !session.has_failed().await {
                return Ok(session);
            }
            let mut sessions = self.sessions.write().await;
            if sessions
                .get(id)
                .is_some_and(|current| Arc::ptr_eq(current, &session))
            {
                sessions.remove(id);
                info!(session_id = %id, "Reloading session after store failure");
            }
        }

        let stored = self.storage.load_session(id)?;
        if !stored.is_active() {
            return Err(SessionError::Ended(id.to_string()));
        }
        let history = self.storage.read_history(id)?;

        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(id.to_string()).or_insert_with(|| {
            Arc::new(LiveSession::restore(id, Arc::clone(&self.storage), history))
        });
        Ok(Arc::clone(session))
    }

    /// Replays the session to a new client channel and subscribes it to
    /// live events.
    pub async fn connect(
        &self,
        id: &str,
        sender: &mpsc::Sender<ServerEvent>,
    ) -> Result<(), SessionError> {
        self.live(id).await?.attach(sender).await
    }

    /// Forgets client channels whose receiving side is gone.
    pub async fn detach_closed(&self, id: &str) {
        let session = self.sessions.read().await.get(id).cloned();
        if let Some(session) = session {
            session.detach_closed().await;
        }
    }

    /// Handles a frame received on the channel bound to `bound_id`.
    pub async fn handle_frame(&self, bound_id: &str, frame: ClientFrame) -> Result<(), SessionError> {
        match frame {
            ClientFrame::UserMessage {
                session_id,
                content,
            } => {
                if session_id != bound_id {
                    let session = self.live(bound_id).await?;
                    let mut inner = session.inner.lock().await;
                    session.check_open(&inner)?;
                    let mismatch = SessionError::Mismatch {
                        expected: bound_id.to_string(),
                        got: session_id,
                    };
                    return Err(session.reject(&mut inner, mismatch));
                }
                self.submit(bound_id, &content).await
            }
        }
    }

    /// Accepts a user message and starts the agent turn answering it.
    pub async fn submit(&self, id: &str, content: &str) -> Result<(), SessionError> {
        let session = self.live(id).await?;
        session.submit(Arc::clone(&self.bridge), content).await
    }

    /// Terminates a session. Succeeds again for an already ended session.
    pub async fn end_session(&self, id: &str) -> Result<StoredSession, SessionError> {
        let stored = self.storage.mark_ended(id)?;
        let live = self.sessions.write().await.remove(id);
        if let Some(session) = live {
            let pending = session.end().await;
            info!(session_id = %id, pending, "Closed live session");
        }
        Ok(stored)
    }

    pub async fn is_live(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn live_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Unloads sessions with no client and no running turn. They are
    /// restored from the store on next use.
    pub async fn evict_idle(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut idle = Vec::new();
        for (id, session) in sessions.iter() {
            if Arc::strong_count(session) == 1 && session.is_idle().await {
                idle.push(id.clone());
            }
        }
        for id in &idle {
            sessions.remove(id);
        }
        if !idle.is_empty() {
            debug!(evicted = idle.len(), "Evicted idle sessions");
        }
        idle.len()
    }

    /// Stops every runner and closes every client channel.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().collect();
        if sessions.is_empty() {
            info!("No live sessions to shut down");
            return;
        }
        info!(count = sessions.len(), "Shutting down live sessions");
        for (_, session) in sessions {
            let mut inner = session.inner.lock().await;
            if let Some(runner) = inner.runner.take() {
                runner.abort();
            }
            inner.senders.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use parley_protocol::{Role, ToolCallStatus};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::bridge::{BridgeError, ScriptedBridge};

    /// Emits `before`, waits for the gate, then emits `after`.
    struct GatedBridge {
        before: Vec<BridgeEvent>,
        after: Vec<BridgeEvent>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl AgentBridge for GatedBridge {
        async fn run_turn(
            &self,
            _request: TurnRequest,
            sink: mpsc::Sender<BridgeEvent>,
        ) -> Result<(), BridgeError> {
            for event in &self.before {
                sink.send(event.clone()).await?;
            }
            self.gate.notified().await;
            for event in &self.after {
                sink.send(event.clone()).await?;
            }
            Ok(())
        }
    }

    fn manager(bridge: Arc<dyn AgentBridge>) -> (tempfile::TempDir, SessionManager, String) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(SessionStorage::new(dir.path()).unwrap());
        let id = storage.create_session().unwrap().id;
        (dir, SessionManager::new(storage, bridge), id)
    }

    fn text(content: &str) -> BridgeEvent {
        BridgeEvent::Text(content.to_string())
    }

    async fn next(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    async fn until_end(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        loop {
            let event = next(rx).await;
            let done = event == ServerEvent::AssistantEnd;
            events.push(event);
            if done {
                return events;
            }
        }
    }

    async fn wait_idle(session: &LiveSession) {
        while session.turn_running().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_turn_is_streamed_and_persisted() {
        let bridge = Arc::new(ScriptedBridge::new(vec![text("Hel"), text("lo")]));
        let (_dir, manager, id) = manager(bridge.clone());
        let (tx, mut rx) = mpsc::channel(64);

        manager.connect(&id, &tx).await.unwrap();
        assert_eq!(next(&mut rx).await, ServerEvent::History { messages: vec![] });

        manager.submit(&id, "  hi  ").await.unwrap();
        assert_eq!(
            until_end(&mut rx).await,
            vec![
                ServerEvent::UserMessage {
                    content: "hi".into()
                },
                ServerEvent::AssistantStart,
                ServerEvent::chunk("Hel"),
                ServerEvent::chunk("lo"),
                ServerEvent::AssistantEnd,
            ]
        );

        let history = manager.storage().read_history(&id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "Hello");
        assert_eq!(history[1].ordinal, Some(1));
        assert_eq!(bridge.requests()[0].content, "hi");
    }

    #[tokio::test]
    async fn test_second_message_during_turn_is_rejected() {
        let gate = Arc::new(Notify::new());
        let bridge = Arc::new(GatedBridge {
            before: vec![text("thinking")],
            after: vec![],
            gate: gate.clone(),
        });
        let (_dir, manager, id) = manager(bridge);
        let (tx, mut rx) = mpsc::channel(64);
        manager.connect(&id, &tx).await.unwrap();
        next(&mut rx).await;

        manager.submit(&id, "first").await.unwrap();
        assert!(matches!(
            manager.submit(&id, "second").await,
            Err(SessionError::TurnInProgress)
        ));

        gate.notify_one();
        let events = until_end(&mut rx).await;
        assert!(events.contains(&ServerEvent::error("A turn is already in progress")));

        let session = manager.live(&id).await.unwrap();
        wait_idle(&session).await;
        let history = manager.storage().read_history(&id).unwrap();
        let roles: Vec<_> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::System, Role::Assistant]);
        assert!(history[1].failed);
    }

    #[tokio::test]
    async fn test_late_client_gets_history_then_in_flight_turn() {
        let gate = Arc::new(Notify::new());
        let bridge = Arc::new(GatedBridge {
            before: vec![
                text("partial "),
                BridgeEvent::ToolUse {
                    id: "t1".into(),
                    name: "read".into(),
                    input: json!({}),
                },
            ],
            after: vec![
                BridgeEvent::ToolResult {
                    tool_use_id: "t1".into(),
                    content: json!("ok"),
                    is_error: false,
                },
                text("answer"),
            ],
            gate: gate.clone(),
        });
        let (_dir, manager, id) = manager(bridge);
        let (first_tx, mut first_rx) = mpsc::channel(64);
        manager.connect(&id, &first_tx).await.unwrap();
        next(&mut first_rx).await;
        manager.submit(&id, "go").await.unwrap();
        for _ in 0..4 {
            next(&mut first_rx).await;
        }

        let (late_tx, mut late_rx) = mpsc::channel(64);
        manager.connect(&id, &late_tx).await.unwrap();
        let ServerEvent::History { messages } = next(&mut late_rx).await else {
            panic!("history must come first");
        };
        assert_eq!(messages.len(), 1);
        assert_eq!(next(&mut late_rx).await, ServerEvent::AssistantStart);
        assert_eq!(next(&mut late_rx).await, ServerEvent::chunk("partial "));
        assert!(matches!(next(&mut late_rx).await, ServerEvent::ToolUse { .. }));

        gate.notify_one();
        let late_rest = until_end(&mut late_rx).await;
        let first_rest = until_end(&mut first_rx).await;
        assert_eq!(late_rest, first_rest);

        let history = manager.storage().read_history(&id).unwrap();
        assert_eq!(history[1].content, "partial answer");
        assert_eq!(history[1].tool_calls[0].status, ToolCallStatus::Done);
    }

    #[tokio::test]
    async fn test_bridge_failure_closes_turn_then_reports() {
        let bridge = Arc::new(ScriptedBridge::new(vec![text("so far")]).failing("model offline"));
        let (_dir, manager, id) = manager(bridge);
        let (tx, mut rx) = mpsc::channel(64);
        manager.connect(&id, &tx).await.unwrap();
        next(&mut rx).await;

        manager.submit(&id, "hi").await.unwrap();
        until_end(&mut rx).await;
        assert_eq!(
            next(&mut rx).await,
            ServerEvent::error("Agent unavailable: model offline")
        );

        let session = manager.live(&id).await.unwrap();
        wait_idle(&session).await;
        let history = manager.storage().read_history(&id).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].content, "so far");
        assert!(history[2].failed);
    }

    #[tokio::test]
    async fn test_unpaired_result_is_persisted_as_orphan() {
        let bridge = Arc::new(ScriptedBridge::new(vec![BridgeEvent::ToolResult {
            tool_use_id: "ghost".into(),
            content: json!("late"),
            is_error: true,
        }]));
        let (_dir, manager, id) = manager(bridge);
        let (tx, mut rx) = mpsc::channel(64);
        manager.connect(&id, &tx).await.unwrap();
        next(&mut rx).await;

        manager.submit(&id, "hi").await.unwrap();
        until_end(&mut rx).await;

        let history = manager.storage().read_history(&id).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].orphan_of.as_deref(), Some("ghost"));
        assert_eq!(history[1].tool_calls[0].status, ToolCallStatus::Error);
        assert_eq!(history[2].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_mismatched_session_id_is_rejected() {
        let (_dir, manager, id) = manager(Arc::new(ScriptedBridge::default()));
        let (tx, mut rx) = mpsc::channel(64);
        manager.connect(&id, &tx).await.unwrap();
        next(&mut rx).await;

        let result = manager
            .handle_frame(&id, ClientFrame::user_message("other", "hi"))
            .await;
        assert!(matches!(result, Err(SessionError::Mismatch { .. })));
        assert!(matches!(next(&mut rx).await, ServerEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_end_session_discards_live_state() {
        let gate = Arc::new(Notify::new());
        let bridge = Arc::new(GatedBridge {
            before: vec![BridgeEvent::ToolUse {
                id: "t1".into(),
                name: "read".into(),
                input: json!({}),
            }],
            after: vec![],
            gate,
        });
        let (_dir, manager, id) = manager(bridge);
        let (tx, mut rx) = mpsc::channel(64);
        manager.connect(&id, &tx).await.unwrap();
        drop(tx);
        next(&mut rx).await;
        manager.submit(&id, "hi").await.unwrap();
        for _ in 0..3 {
            next(&mut rx).await;
        }

        let ended = manager.end_session(&id).await.unwrap();
        assert!(!ended.is_active());
        assert!(!manager.is_live(&id).await);
        assert!(rx.recv().await.is_none());

        assert!(matches!(
            manager.submit(&id, "again").await,
            Err(SessionError::Ended(_))
        ));
        let (tx, _rx) = mpsc::channel(8);
        assert!(matches!(
            manager.connect(&id, &tx).await,
            Err(SessionError::Ended(_))
        ));
        assert!(manager.end_session(&id).await.is_ok());
        assert_eq!(manager.storage().read_history(&id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restored_session_continues_ordinals() {
        let bridge: Arc<dyn AgentBridge> = Arc::new(ScriptedBridge::new(vec![text("ok")]));
        let (_dir, manager, id) = manager(bridge.clone());
        let (tx, mut rx) = mpsc::channel(64);
        manager.connect(&id, &tx).await.unwrap();
        next(&mut rx).await;
        manager.submit(&id, "one").await.unwrap();
        until_end(&mut rx).await;
        wait_idle(&manager.live(&id).await.unwrap()).await;

        let restarted = SessionManager::new(Arc::clone(manager.storage()), bridge);
        let (tx, mut rx) = mpsc::channel(64);
        restarted.connect(&id, &tx).await.unwrap();
        let ServerEvent::History { messages } = next(&mut rx).await else {
            panic!("history must come first");
        };
        assert_eq!(messages.len(), 2);

        restarted.submit(&id, "two").await.unwrap();
        until_end(&mut rx).await;
        let ordinals: Vec<_> = restarted
            .storage()
            .read_history(&id)
            .unwrap()
            .iter()
            .map(|m| m.ordinal)
            .collect();
        assert_eq!(ordinals, vec![Some(0), Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (_dir, manager, _id) = manager(Arc::new(ScriptedBridge::default()));
        let (tx, _rx) = mpsc::channel(8);
        assert!(matches!(
            manager.connect("missing", &tx).await,
            Err(SessionError::Storage(StorageError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_stalled_client_does_not_block_the_session() {
        let gate = Arc::new(Notify::new());
        let bridge = Arc::new(GatedBridge {
            before: vec![text("a"), text("b"), text("c"), text("d")],
            after: vec![],
            gate,
        });
        let (_dir, manager, id) = manager(bridge);

        // Never read: fills after two events.
        let (stalled_tx, _stalled_rx) = mpsc::channel(2);
        manager.connect(&id, &stalled_tx).await.unwrap();
        drop(stalled_tx);
        let (tx, mut rx) = mpsc::channel(64);
        manager.connect(&id, &tx).await.unwrap();
        drop(tx);
        next(&mut rx).await;

        manager.submit(&id, "hi").await.unwrap();
        for _ in 0..6 {
            next(&mut rx).await;
        }

        let ended = tokio::time::timeout(Duration::from_secs(3), manager.end_session(&id))
            .await
            .expect("end_session waited on a stalled client");
        assert!(!ended.unwrap().is_active());
        assert!(
            tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_store_failure_closes_session_and_reloads() {
        let bridge = Arc::new(ScriptedBridge::new(vec![text("never saved")]));
        let (dir, manager, id) = manager(bridge.clone());
        let (tx, mut rx) = mpsc::channel(64);
        manager.connect(&id, &tx).await.unwrap();
        drop(tx);
        next(&mut rx).await;

        // A directory where the history file belongs makes every append fail.
        let history = dir.path().join("history").join(format!("{id}.jsonl"));
        std::fs::create_dir(&history).unwrap();

        assert!(matches!(
            manager.submit(&id, "hi").await,
            Err(SessionError::Unavailable(_))
        ));
        let ServerEvent::Error { content } = next(&mut rx).await else {
            panic!("clients must hear about the failure");
        };
        assert!(content.contains("could not be saved"));
        assert!(rx.recv().await.is_none());
        assert!(bridge.requests().is_empty());

        std::fs::remove_dir(&history).unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        manager.connect(&id, &tx).await.unwrap();
        assert_eq!(next(&mut rx).await, ServerEvent::History { messages: vec![] });

        manager.submit(&id, "again").await.unwrap();
        until_end(&mut rx).await;
        let ordinals: Vec<_> = manager
            .storage()
            .read_history(&id)
            .unwrap()
            .iter()
            .map(|m| m.ordinal)
            .collect();
        assert_eq!(ordinals, vec![Some(0), Some(1)]);
    }

    #[tokio::test]
    async fn test_evicts_only_idle_sessions() {
        let (_dir, manager, id) = manager(Arc::new(ScriptedBridge::default()));
        let (tx, mut rx) = mpsc::channel(8);
        manager.connect(&id, &tx).await.unwrap();
        next(&mut rx).await;

        assert_eq!(manager.evict_idle().await, 0);
        drop(rx);
        assert_eq!(manager.evict_idle().await, 1);
        assert_eq!(manager.live_count().await, 0);
    }
}
