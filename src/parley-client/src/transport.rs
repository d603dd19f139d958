//! Wire channel abstraction and its WebSocket implementation.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// A raw inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// One open channel bound to a session.
#[async_trait]
pub trait Channel: Send {
    /// Sends one text frame.
    async fn send(&mut self, text: String) -> ClientResult<()>;

    /// Next inbound frame. `None` once the peer closed the channel.
    async fn recv(&mut self) -> Option<ClientResult<Frame>>;

    /// Closes the channel. Errors are ignored.
    async fn close(&mut self);
}

/// Opens channels for a session.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, session_id: &str) -> ClientResult<Box<dyn Channel>>;
}

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport against `/api/v1/ws/sessions/{id}`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    config: ClientConfig,
}

impl WsTransport {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, session_id: &str) -> ClientResult<Box<dyn Channel>> {
        let url = self.config.channel_url(session_id)?;
        debug!(%url, "Opening session channel");
        let (stream, _) = connect_async(url.as_str()).await?;
        Ok(Box::new(WsChannel { stream }))
    }
}

struct WsChannel {
    stream: WsConnection,
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, text: String) -> ClientResult<()> {
        self.stream.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<ClientResult<Frame>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(Frame::Text(text))),
                Ok(WsMessage::Binary(bytes)) => return Some(Ok(Frame::Binary(bytes))),
                Ok(WsMessage::Close(frame)) => {
                    debug!(?frame, "Channel closed by server");
                    return None;
                }
                // Pings are answered by tungstenite on the next read.
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {}
                Err(err) => {
                    return match ClientError::from(err) {
                        ClientError::Closed => None,
                        other => Some(Err(other)),
                    };
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            debug!(error = %err, "Error while closing channel");
        }
    }
}
