use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::codec::LengthDelimitedCodec;

pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Frames carry a 4-byte big-endian length prefix followed by one JSON
/// document.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// A bus message sent by a TCP client.
///
/// ```json
/// {"address": "carbon.memcached", "body": {"command": "get", "key": "k"}}
/// ```
///
/// With `reply` false the message is delivered and nothing is written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub address: String,
    pub body: Value,
    #[serde(default = "reply_by_default")]
    pub reply: bool,
}

fn reply_by_default() -> bool {
    true
}

impl Request {
    pub fn new(address: impl Into<String>, body: Value) -> Self {
        Self {
            address: address.into(),
            body,
            reply: true,
        }
    }

    pub fn without_reply(mut self) -> Self {
        self.reply = false;
        self
    }

    pub fn encode(&self) -> Result<Bytes, String> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| format!("Failed to encode request: {}", e))
    }

    pub fn decode(buf: Bytes) -> Result<Self, String> {
        if buf.is_empty() {
            return Err("Empty buffer".to_string());
        }
        serde_json::from_slice(&buf).map_err(|e| format!("Invalid request: {}", e))
    }
}

pub fn encode_reply(reply: &Value) -> Bytes {
    // serializing a Value cannot fail
    Bytes::from(serde_json::to_vec(reply).unwrap_or_default())
}

pub fn decode_reply(buf: Bytes) -> Result<Value, String> {
    serde_json::from_slice(&buf).map_err(|e| format!("Invalid reply: {}", e))
}

/// Written back when the bridge itself fails, in the same shape as a
/// handler's error reply.
pub fn bridge_error(message: impl Into<String>) -> Value {
    json!({
        "status": "error",
        "message": message.into(),
    })
}
