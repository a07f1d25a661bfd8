//! Length-prefixed JSON codec for CapSync frames.
//!
//! Wire format:
//! ```text
//! [body_len:4][body:N]
//! ```
//! `body_len` is a big-endian `u32`; `body` is one UTF-8 JSON object carrying
//! a string `type` field.  Frames larger than [`MAX_FRAME_SIZE`] are protocol
//! violations.
//!
//! The functions here work on byte slices only.  The async channel in the
//! host crate accumulates bytes from the socket and calls [`decode_frame`]
//! until it stops reporting [`ProtocolError::InsufficientData`].

use serde_json::Value;
use thiserror::Error;

use crate::protocol::messages::Message;

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest body accepted or produced (10 MiB).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The buffer does not yet hold a complete frame.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The declared (or produced) body length exceeds the ceiling.
    #[error("frame of {declared} bytes exceeds the {max} byte ceiling")]
    OversizedFrame { declared: usize, max: usize },

    /// A frame declared a zero-length body.
    #[error("empty frame")]
    EmptyFrame,

    /// The body is not valid UTF-8 JSON, or is not a JSON object.
    #[error("malformed JSON body: {0}")]
    MalformedJson(String),

    /// The body has no string `type` field.
    #[error("message has no string `type` field")]
    MissingType,

    /// The message could not be serialized.
    #[error("failed to serialize message: {0}")]
    Serialize(String),
}

impl ProtocolError {
    /// `true` only for the "wait for more bytes" case.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::InsufficientData { .. })
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Message`] as one length-prefixed frame.
///
/// # Errors
///
/// Returns [`ProtocolError::OversizedFrame`] if the body would exceed
/// [`MAX_FRAME_SIZE`], or [`ProtocolError::Serialize`] if JSON encoding fails.
///
/// # Examples
///
/// ```rust
/// use capsync_core::protocol::{decode_frame, encode_frame, Message};
///
/// let msg = Message::new("heartbeat", Default::default()).with_timestamp(1.5);
/// let bytes = encode_frame(&msg).unwrap();
/// let (decoded, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(&Value::Object(msg.to_object()))
        .map_err(|e| ProtocolError::Serialize(e.to_string()))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::OversizedFrame {
            declared: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Validates the length prefix at the start of `bytes`.
///
/// Returns the declared body length once four bytes are available.  The
/// ceiling is checked here, before any body byte is needed, so a hostile
/// length field never causes a large allocation.
///
/// # Errors
///
/// [`ProtocolError::InsufficientData`] with fewer than four bytes,
/// [`ProtocolError::EmptyFrame`] or [`ProtocolError::OversizedFrame`] for a
/// bad length.
pub fn read_frame_len(bytes: &[u8]) -> Result<usize, ProtocolError> {
    if bytes.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: LENGTH_PREFIX_SIZE,
            available: bytes.len(),
        });
    }
    let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if declared == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    if declared > MAX_FRAME_SIZE {
        return Err(ProtocolError::OversizedFrame {
            declared,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(declared)
}

/// Decodes one [`Message`] from the beginning of `bytes`.
///
/// Returns the message and the number of bytes consumed so the caller can
/// advance its buffer.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] when more bytes are needed;
/// every other variant means the stream is unusable.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), ProtocolError> {
    let body_len = read_frame_len(bytes)?;
    let total = LENGTH_PREFIX_SIZE + body_len;
    if bytes.len() < total {
        return Err(ProtocolError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }

    let msg = decode_body(&bytes[LENGTH_PREFIX_SIZE..total])?;
    Ok((msg, total))
}

/// Parses a frame body (without the length prefix).
///
/// # Errors
///
/// [`ProtocolError::MalformedJson`] or [`ProtocolError::MissingType`].
pub fn decode_body(body: &[u8]) -> Result<Message, ProtocolError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
    match value {
        Value::Object(object) => Message::from_object(object),
        _ => Err(ProtocolError::MalformedJson(
            "frame body is not a JSON object".to_string(),
        )),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
