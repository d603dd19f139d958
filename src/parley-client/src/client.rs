//! Per-session event loop.
//!
//! [`SessionClient::run`] owns one [`ChatSession`] and is the only place that
//! suspends: it waits for the next frame, the next user command, a pending
//! connect or the reconnect deadline, whichever comes first, and applies the
//! result synchronously before waiting again.

use std::sync::Arc;

use futures::future::BoxFuture;
use parley_protocol::{DecodeError, encode_client_frame};
use parley_session::{ChatSession, LossOutcome, Projector, ReconnectPolicy, ReconnectTimer};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::error::{ClientError, ClientResult};
use crate::http::SessionControl;
use crate::transport::{Channel, Frame, Transport};

/// User actions fed into a running client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Send a user message.
    Send(String),
    /// Reopen the channel after reconnects were exhausted.
    Retry,
    /// Terminate the session on the backend, then stop.
    End,
    /// Stop without ending the session.
    Shutdown,
}

/// Why [`SessionClient::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The session was ended on the backend.
    Ended,
    /// The command stream stopped or asked to shut down.
    Shutdown,
}

enum Link {
    Connecting {
        pending: BoxFuture<'static, ClientResult<Box<dyn Channel>>>,
        generation: u64,
    },
    Up {
        channel: Box<dyn Channel>,
        generation: u64,
    },
    Waiting {
        timer: ReconnectTimer,
        deadline: Instant,
    },
    Idle,
}

enum Step {
    Opened(ClientResult<Box<dyn Channel>>),
    Frame(Option<ClientResult<Frame>>),
    TimerFired,
    Command(Option<Command>),
}

pub struct SessionClient<T: Transport> {
    session: ChatSession,
    transport: Arc<T>,
    control: Arc<dyn SessionControl>,
}

impl<T: Transport + 'static> SessionClient<T> {
    pub fn new(
        session_id: impl Into<String>,
        policy: ReconnectPolicy,
        transport: T,
        control: Arc<dyn SessionControl>,
    ) -> Self {
        Self {
            session: ChatSession::new(session_id, policy),
            transport: Arc::new(transport),
            control,
        }
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    /// Drives the session until it is ended or shut down.
    pub async fn run(
        &mut self,
        mut commands: mpsc::Receiver<Command>,
        projector: &mut dyn Projector,
    ) -> ClientResult<RunOutcome> {
        let generation = self.session.open(projector)?;
        let mut link = self.connect(generation);

        loop {
            let step = match &mut link {
                Link::Connecting { pending, .. } => tokio::select! {
                    opened = pending.as_mut() => Step::Opened(opened),
                    command = commands.recv() => Step::Command(command),
                },
                Link::Up { channel, .. } => tokio::select! {
                    frame = channel.recv() => Step::Frame(frame),
                    command = commands.recv() => Step::Command(command),
                },
                Link::Waiting { deadline, .. } => tokio::select! {
                    _ = sleep_until(*deadline) => Step::TimerFired,
                    command = commands.recv() => Step::Command(command),
                },
                Link::Idle => Step::Command(commands.recv().await),
            };

            link = match step {
                Step::Opened(opened) => match link {
                    Link::Connecting { generation, .. } => {
                        match self.opened(generation, opened, projector).await {
                            Ok(link) => link,
                            Err(refusal) => return self.refused(refusal, projector),
                        }
                    }
                    other => other,
                },
                Step::Frame(Some(Ok(frame))) => {
                    self.handle_frame(frame, projector);
                    link
                }
                Step::Frame(Some(Err(err))) => {
                    warn!(session_id = %self.session.session_id(), error = %err, "Channel error");
                    self.disconnect(link, projector).await
                }
                Step::Frame(None) => {
                    info!(session_id = %self.session.session_id(), "Channel closed by server");
                    self.disconnect(link, projector).await
                }
                Step::TimerFired => match link {
                    Link::Waiting { timer, .. } => match self.session.timer_fired(timer, projector) {
                        Some(generation) => self.connect(generation),
                        None => Link::Idle,
                    },
                    other => other,
                },
                Step::Command(None) | Step::Command(Some(Command::Shutdown)) => {
                    close(link).await;
                    return Ok(RunOutcome::Shutdown);
                }
                Step::Command(Some(Command::Send(text))) => {
                    self.send(link, &text, projector).await
                }
                Step::Command(Some(Command::Retry)) => match self.session.retry(projector) {
                    Ok(generation) => {
                        close(link).await;
                        self.connect(generation)
                    }
                    Err(err) => {
                        projector.status(&err.to_string());
                        link
                    }
                },
                Step::Command(Some(Command::End)) => {
                    let session_id = self.session.session_id().to_string();
                    match self.control.end_session(&session_id).await {
                        Ok(()) => {
                            close(link).await;
                            self.session.end(projector);
                            return Ok(RunOutcome::Ended);
                        }
                        Err(err) => {
                            error!(session_id = %session_id, error = %err, "Failed to end session");
                            projector.status(&format!("Could not end session: {err}"));
                            link
                        }
                    }
                }
            };
        }
    }

    /// Starts opening a channel. The attempt is raced against user commands
    /// by the loop.
    fn connect(&self, generation: u64) -> Link {
        let transport = Arc::clone(&self.transport);
        let session_id = self.session.session_id().to_string();
        Link::Connecting {
            pending: Box::pin(async move { transport.connect(&session_id).await }),
            generation,
        }
    }

    /// Applies a finished connect attempt. Only a permanent refusal is
    /// returned as an error; every other failure counts against the
    /// reconnect bound.
    async fn opened(
        &mut self,
        generation: u64,
        opened: ClientResult<Box<dyn Channel>>,
        projector: &mut dyn Projector,
    ) -> ClientResult<Link> {
        let session_id = self.session.session_id().to_string();
        match opened {
            Ok(mut channel) => {
                if self.session.transport_connected(generation, projector) {
                    Ok(Link::Up {
                        channel,
                        generation,
                    })
                } else {
                    channel.close().await;
                    Ok(Link::Idle)
                }
            }
            Err(err) if err.is_permanent_refusal() => {
                warn!(session_id = %session_id, generation, error = %err, "Channel refused");
                Err(err)
            }
            Err(err) => {
                warn!(session_id = %session_id, generation, error = %err, "Connect failed");
                Ok(self.after_loss(generation, projector))
            }
        }
    }

    /// Tears the session down after a permanent refusal. A `410 Gone` means
    /// the session was ended elsewhere.
    fn refused(
        &mut self,
        err: ClientError,
        projector: &mut dyn Projector,
    ) -> ClientResult<RunOutcome> {
        self.session.end(projector);
        match err {
            ClientError::Refused { status: 410 } => {
                projector.status("Session has ended.");
                Ok(RunOutcome::Ended)
            }
            other => {
                projector.status(&other.to_string());
                Err(other)
            }
        }
    }

    async fn disconnect(&mut self, link: Link, projector: &mut dyn Projector) -> Link {
        match link {
            Link::Up {
                mut channel,
                generation,
            } => {
                channel.close().await;
                self.after_loss(generation, projector)
            }
            other => other,
        }
    }

    fn after_loss(&mut self, generation: u64, projector: &mut dyn Projector) -> Link {
        match self.session.transport_lost(generation, projector) {
            LossOutcome::Reconnect(timer) => {
                projector.status(&format!(
                    "Connection lost. Reconnecting in {}s (attempt {}/{})",
                    timer.delay().as_secs_f32(),
                    timer.attempt(),
                    self.session.connection().policy().max_attempts
                ));
                Link::Waiting {
                    timer,
                    deadline: Instant::now() + timer.delay(),
                }
            }
            LossOutcome::Exhausted => {
                projector.status("Connection lost. Use /retry to reconnect.");
                Link::Idle
            }
            LossOutcome::Stale => Link::Idle,
        }
    }

    fn handle_frame(&mut self, frame: Frame, projector: &mut dyn Projector) {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(err) => {
                    let err = DecodeError::from(err.utf8_error());
                    warn!(
                        session_id = %self.session.session_id(),
                        reason = err.label(),
                        error = %err,
                        "Dropping undecodable frame"
                    );
                    return;
                }
            },
        };
        // Decode failures are logged by the session and leave state untouched.
        let _ = self.session.receive_frame(&text, projector);
    }

    async fn send(&mut self, link: Link, text: &str, projector: &mut dyn Projector) -> Link {
        let (mut channel, generation) = match link {
            Link::Up {
                channel,
                generation,
            } => (channel, generation),
            other => {
                projector.status("Not connected; message not sent.");
                return other;
            }
        };

        let frame = match self.session.prepare_send(text, projector) {
            Ok(frame) => frame,
            Err(rejected) => {
                debug!(session_id = %self.session.session_id(), %rejected, "Input rejected");
                projector.status(&ClientError::from(rejected).to_string());
                return Link::Up {
                    channel,
                    generation,
                };
            }
        };

        let payload = match encode_client_frame(&frame) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "Failed to encode user message");
                return Link::Up {
                    channel,
                    generation,
                };
            }
        };

        match channel.send(payload).await {
            Ok(()) => Link::Up {
                channel,
                generation,
            },
            Err(err) => {
                warn!(session_id = %self.session.session_id(), error = %err, "Send failed");
                channel.close().await;
                self.after_loss(generation, projector)
            }
        }
    }
}

async fn close(link: Link) {
    if let Link::Up { mut channel, .. } = link {
        channel.close().await;
    }
}
