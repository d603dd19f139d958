//! Parley Protocol - wire frames for a streaming chat session.
//!
//! One channel carries one session. The backend streams [`ServerEvent`]s that
//! describe history replay, user echoes and the pieces of an assistant turn
//! (text fragments, tool invocations, tool results). The client sends
//! [`ClientFrame`]s carrying user input.
//!
//! Decoding is total: every frame either decodes into a typed value or yields
//! a [`DecodeError`] the caller can log and drop without tearing down the
//! channel.

pub mod codec;
pub mod frames;
pub mod history;

#[cfg(test)]
mod tests;

pub use codec::{
    DecodeError, decode_client_frame, decode_client_frame_bytes, decode_server_event,
    decode_server_event_bytes, encode_client_frame, encode_server_event,
};
pub use frames::{ClientFrame, ServerEvent};
pub use history::{HistoryMessage, Role, ToolCallRecord, ToolCallStatus};
