//! JSON wire format for the browser shim.
//!
//! Every frame is a single JSON object tagged with `type`. Patch payloads
//! are whatever the root view rendered; when that is itself JSON it is
//! embedded verbatim, otherwise it rides along base64-encoded.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use riptide_core::frame::{FrameCodec, InboundFrame, OutboundFrame, ProtocolError};
use serde_json::{json, Value};

#[derive(Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl FrameCodec for JsonCodec {
    fn encode(&self, frame: &OutboundFrame) -> Bytes {
        let value = match frame {
            OutboundFrame::HandshakeAck { session_id, base_seq, resumed, replayed } => json!({
                "type": "handshake_ack",
                "session_id": session_id,
                "base_seq": base_seq,
                "resumed": resumed,
                "replayed": replayed,
            }),
            OutboundFrame::Patch { seq, payload } => match serde_json::from_slice::<Value>(payload)
            {
                Ok(body) => json!({ "type": "patch", "seq": seq, "payload": body }),
                Err(_) => json!({
                    "type": "patch",
                    "seq": seq,
                    "payload_b64": BASE64.encode(payload),
                }),
            },
            OutboundFrame::Error(error) => json!({
                "type": "error",
                "code": error.code,
                "message": error.message,
            }),
            OutboundFrame::Pong => json!({ "type": "pong" }),
        };
        serde_json::to_vec(&value).map(Bytes::from).unwrap_or_default()
    }

    fn decode(&self, bytes: &[u8]) -> Result<InboundFrame, ProtocolError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|err| ProtocolError::malformed("frame", err.to_string()))?;
        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_string(),
            None => return Err(ProtocolError::malformed("frame", "missing type tag")),
        };
        match kind.as_str() {
            "handshake" => serde_json::from_value(value)
                .map(InboundFrame::Handshake)
                .map_err(|err| ProtocolError::malformed("handshake", err.to_string())),
            "event" => serde_json::from_value(value)
                .map(InboundFrame::Event)
                .map_err(|err| ProtocolError::malformed("event", err.to_string())),
            "ping" => Ok(InboundFrame::Ping),
            "pong" => Ok(InboundFrame::Pong),
            other => Err(ProtocolError::malformed("frame", format!("unknown type {other}"))),
        }
    }
}
