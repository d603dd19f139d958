//! Parley Client - drives one chat session from a terminal or any other
//! front end.
//!
//! This crate provides:
//! - [`Transport`] / [`Channel`]: the wire channel seam, with [`WsTransport`]
//!   speaking WebSocket to the backend
//! - [`SessionClient`]: the per-session event loop (frames, reconnect timers,
//!   user commands)
//! - [`SessionApi`]: one-shot REST calls (create and end a session)
//! - [`TerminalProjector`]: line-oriented rendering

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod terminal;
pub mod transport;

pub use client::{Command, RunOutcome, SessionClient};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use http::{CreatedSession, SessionApi, SessionControl};
pub use terminal::TerminalProjector;
pub use transport::{Channel, Frame, Transport, WsTransport};
