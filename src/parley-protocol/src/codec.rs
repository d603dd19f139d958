//! Total frame decoding and encoding.
//!
//! Decoding runs in two phases: the frame is parsed as JSON and its `type`
//! discriminant is checked against the known kinds, then the payload is
//! decoded for that kind. Each phase has its own [`DecodeError`] variant so a
//! caller can log precisely why a frame was dropped.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::frames::{ClientFrame, ServerEvent};

/// Why a frame could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Binary frame that is not UTF-8 text.
    #[error("frame is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    /// Syntactically invalid JSON.
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Valid JSON without a string `type` field at the top level.
    #[error("frame has no string `type` discriminant")]
    MissingDiscriminant,

    /// Discriminant not part of the protocol.
    #[error("unrecognized frame type `{0}`")]
    UnknownKind(String),

    /// Known discriminant with a payload that does not match its schema.
    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Short machine-readable label, used as a log field.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotUtf8(_) => "not_utf8",
            Self::Malformed(_) => "malformed",
            Self::MissingDiscriminant => "missing_discriminant",
            Self::UnknownKind(_) => "unknown_kind",
            Self::InvalidPayload { .. } => "invalid_payload",
        }
    }
}

/// Decode a backend frame.
pub fn decode_server_event(text: &str) -> Result<ServerEvent, DecodeError> {
    decode_tagged(text, &ServerEvent::KINDS)
}

/// Decode a backend frame delivered as binary.
pub fn decode_server_event_bytes(bytes: &[u8]) -> Result<ServerEvent, DecodeError> {
    decode_server_event(std::str::from_utf8(bytes)?)
}

/// Decode a client frame.
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, DecodeError> {
    decode_tagged(text, &ClientFrame::KINDS)
}

/// Decode a client frame delivered as binary.
pub fn decode_client_frame_bytes(bytes: &[u8]) -> Result<ClientFrame, DecodeError> {
    decode_client_frame(std::str::from_utf8(bytes)?)
}

/// Encode a backend frame.
pub fn encode_server_event(event: &ServerEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

/// Encode a client frame.
pub fn encode_client_frame(frame: &ClientFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

fn decode_tagged<T: DeserializeOwned>(text: &str, kinds: &[&str]) -> Result<T, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::Malformed)?;

    let kind = value
        .as_object()
        .and_then(|object| object.get("type"))
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingDiscriminant)?;

    if !kinds.contains(&kind) {
        return Err(DecodeError::UnknownKind(kind.to_string()));
    }
    let kind = kind.to_string();

    serde_json::from_value(value).map_err(|source| DecodeError::InvalidPayload { kind, source })
}
