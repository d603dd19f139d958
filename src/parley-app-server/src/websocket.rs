//! Session channel over WebSocket.
//!
//! One socket is bound to one session id. Unknown, invalid or ended sessions
//! are refused before the upgrade (404, 400, 410) so clients do not mistake a
//! refusal for a dropped connection. On connect the client receives a single
//! `history` frame, then the events of any turn already in flight, then live
//! events. Undecodable client frames are logged and dropped; the socket stays
//! open.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use parley_protocol::{
    ClientFrame, DecodeError, ServerEvent, decode_client_frame, decode_client_frame_bytes,
    encode_server_event,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::session_manager::SessionError;
use crate::state::AppState;

/// Outbound queue depth per socket.
const OUTBOUND_CAPACITY: usize = 256;

/// Create WebSocket routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/ws/sessions/{id}", get(session_websocket_handler))
}

/// Handle session-specific WebSocket.
async fn session_websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> AppResult<Response> {
    state.sessions.live(&session_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, session_id)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: String) {
    let connection_id = Uuid::new_v4().to_string();
    info!(%connection_id, %session_id, "WebSocket connected");

    let (sender, receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<ServerEvent>(OUTBOUND_CAPACITY);
    let mut sender_task = tokio::spawn(handle_sender(sender, rx));

    // The session may have ended between the upgrade and this point.
    if let Err(e) = state.sessions.connect(&session_id, &tx).await {
        warn!(%connection_id, %session_id, error = %e, "Refusing session channel");
        let _ = tx.send(ServerEvent::error(refusal(&e))).await;
        drop(tx);
        let _ = sender_task.await;
        return;
    }
    // The session now holds the only sender; the socket closes once the
    // session drops it.
    drop(tx);

    tokio::select! {
        _ = &mut sender_task => {
            debug!(%connection_id, "Outbound channel closed by session");
        }
        _ = handle_receiver(receiver, &state, &session_id, &connection_id) => {}
    }

    sender_task.abort();
    state.sessions.detach_closed(&session_id).await;
    info!(%connection_id, %session_id, "WebSocket disconnected");
}

fn refusal(error: &SessionError) -> String {
    match error {
        SessionError::Ended(id) => format!("Session {id} has ended"),
        other => other.to_string(),
    }
}

/// Handle outgoing messages.
async fn handle_sender(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerEvent>,
) {
    while let Some(event) = rx.recv().await {
        let text = match encode_server_event(&event) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize event: {}", e);
                continue;
            }
        };

        if let Err(e) = sender.send(Message::Text(text.into())).await {
            debug!("Failed to send frame: {}", e);
            return;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}

/// Handle incoming messages until the client closes.
async fn handle_receiver(
    mut receiver: SplitStream<WebSocket>,
    state: &AppState,
    session_id: &str,
    connection_id: &str,
) {
    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!(%connection_id, "WebSocket receive error: {}", e);
                break;
            }
        };

        let decoded = match msg {
            Message::Text(text) => decode_client_frame(text.as_str()),
            Message::Binary(data) => decode_client_frame_bytes(&data),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                debug!(%connection_id, "WebSocket close requested");
                break;
            }
        };

        match decoded {
            Ok(frame) => handle_frame(state, session_id, frame).await,
            Err(e) => log_decode_failure(connection_id, &e),
        }
    }
}

async fn handle_frame(state: &AppState, session_id: &str, frame: ClientFrame) {
    let kind = frame.kind();
    match state.sessions.handle_frame(session_id, frame).await {
        Ok(()) => debug!(%session_id, kind, "Accepted client frame"),
        // Rejected input reaches clients as an `error` event.
        Err(e) => info!(%session_id, kind, error = %e, "Client frame rejected"),
    }
}

fn log_decode_failure(connection_id: &str, error: &DecodeError) {
    warn!(
        %connection_id,
        reason = error.label(),
        error = %error,
        "Dropping undecodable client frame"
    );
}
