//! Frame codec
//!
//! Stateless translation between transport frames and JSON-RPC payloads.
//! A frame is either UTF-8 text or binary carrying UTF-8 JSON; the binary
//! bit is preserved so responses go back in the same mode. Payloads are a
//! single envelope object or a non-empty array of envelopes (a batch).

use crate::protocol::{ErrorCode, ErrorObject};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

/// A single transport frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame
    Text(String),
    /// Binary frame carrying UTF-8 JSON
    Binary(Vec<u8>),
}

impl Frame {
    /// Build a frame from a serialized payload, choosing the modality
    pub fn from_payload(payload: String, binary: bool) -> Self {
        if binary {
            Frame::Binary(payload.into_bytes())
        } else {
            Frame::Text(payload)
        }
    }

    /// Whether this is a binary frame
    pub fn is_binary(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert into a WebSocket message
    pub(crate) fn into_message(self) -> Message {
        match self {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
        }
    }

    /// Extract a frame from a WebSocket message; control frames yield `None`
    pub(crate) fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(Frame::Text(text)),
            Message::Binary(bytes) => Some(Frame::Binary(bytes)),
            _ => None,
        }
    }
}

/// A decoded inbound payload
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// Envelope items in wire order
    pub items: Vec<Value>,
    /// Whether the payload was a batch (JSON array)
    pub batch: bool,
}

/// Decode a frame into its envelope items
///
/// Non-JSON payloads (including invalid UTF-8 in a binary frame) fail with
/// `ParseError`; an empty array fails with `InvalidRequest` carrying the
/// data `"Empty Array"`.
pub fn decode(frame: &Frame) -> Result<Inbound, ErrorObject> {
    let text = match frame {
        Frame::Text(text) => text.as_str(),
        Frame::Binary(bytes) => std::str::from_utf8(bytes)
            .map_err(|_| ErrorObject::new(ErrorCode::ParseError).with_data("Invalid JSON"))?,
    };

    let parsed: Value = serde_json::from_str(text)
        .map_err(|_| ErrorObject::new(ErrorCode::ParseError).with_data("Invalid JSON"))?;

    match parsed {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(ErrorObject::new(ErrorCode::InvalidRequest).with_data("Empty Array"));
            }
            Ok(Inbound { items, batch: true })
        }
        single => Ok(Inbound {
            items: vec![single],
            batch: false,
        }),
    }
}

/// Encode outbound responses into a frame
///
/// Returns `None` when there is nothing to send. The batch form is used
/// iff the corresponding inbound payload was a batch; otherwise the sole
/// response object is sent bare. The frame modality mirrors the request.
pub fn encode(responses: Vec<Value>, batch: bool, binary: bool) -> Option<Frame> {
    if responses.is_empty() {
        return None;
    }

    let payload = if batch {
        Value::Array(responses).to_string()
    } else {
        // Single inbound item yields at most one response.
        responses[0].to_string()
    };

    Some(Frame::from_payload(payload, binary))
}
