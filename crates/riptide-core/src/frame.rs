//! Semantic frames exchanged between a session and its client shim.
//!
//! The engine deals only in these shapes; the byte-level encoding is left to
//! a [`FrameCodec`] supplied by the hosting binary so the wire format can
//! evolve without touching session logic.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Patch sequence number. Strictly increasing per session, starting at 1;
/// 0 means "nothing acknowledged yet".
pub type Seq = u64;

/// First frame a client sends on a fresh socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Prior session id when the client believes it can resume.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Highest patch sequence the client has applied.
    #[serde(default)]
    pub last_ack: Seq,
    pub csrf: String,
    #[serde(default = "default_route")]
    pub route: String,
}

fn default_route() -> String {
    "/".to_string()
}

/// A UI event targeted at a handler registered by the session's root view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub handler: String,
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidHandshake,
    InvalidCsrf,
    ServerBusy,
    TooManySessions,
    NotAuthorized,
    EventQueueFull,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorFrame {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Frames a session can receive.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Handshake(HandshakeRequest),
    Event(EventFrame),
    Ping,
    Pong,
}

/// Frames a session can emit.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    HandshakeAck {
        session_id: String,
        /// Sequence the client should treat as its baseline; the next patch
        /// carries `base_seq + 1`.
        base_seq: Seq,
        resumed: bool,
        /// Number of history frames replayed immediately after this ack.
        replayed: u32,
    },
    Patch {
        seq: Seq,
        payload: Bytes,
    },
    Error(ErrorFrame),
    Pong,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed {op} frame: {message}")]
    Malformed { op: &'static str, message: String },
}

impl ProtocolError {
    pub fn malformed(op: &'static str, message: impl Into<String>) -> Self {
        Self::Malformed { op, message: message.into() }
    }
}

/// Byte-level encoding seam between the engine and a concrete wire format.
pub trait FrameCodec: Send + Sync {
    fn encode(&self, frame: &OutboundFrame) -> Bytes;
    fn decode(&self, bytes: &[u8]) -> Result<InboundFrame, ProtocolError>;
}
