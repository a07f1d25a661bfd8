//! Wire message model for the CapSync device protocol.
//!
//! Every frame body is one JSON object with a required string field `type`
//! and an optional float field `timestamp` (sender clock, seconds since the
//! Unix epoch).  All other fields form the message payload.
//!
//! Two representations exist:
//!
//! - [`Message`] – the untyped wire unit (`kind`, `payload`, `timestamp`).
//!   This is what the codec reads and writes, and what unknown kinds are
//!   forwarded as.
//! - [`DeviceMessage`] – a closed enum with one variant per known kind plus
//!   [`DeviceMessage::Unrecognized`].  It is decoded once, at the channel
//!   boundary, so the rest of the host can `match` instead of comparing
//!   strings.
//!
//! # Why keep an "unrecognized" variant? (for beginners)
//!
//! Devices and host are released on different schedules.  A newer phone app
//! may send a kind the host has never heard of, or an older app may send a
//! known kind with a field of the wrong type.  Rather than dropping such
//! messages, the decoder hands them back untouched so a generic subscriber
//! can still see them.  New message kinds therefore need no change here.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::domain::device::DeviceStatus;
use crate::domain::session::RecordingOptions;
use crate::protocol::codec::ProtocolError;

/// Protocol version announced in `handshake_ack`.
pub const PROTOCOL_VERSION: u32 = 1;

/// String discriminators for every known message kind.
pub mod kinds {
    pub const HELLO: &str = "hello";
    pub const HANDSHAKE: &str = "handshake";
    pub const HANDSHAKE_ACK: &str = "handshake_ack";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const HEARTBEAT_RESPONSE: &str = "heartbeat_response";
    pub const STATUS: &str = "status";
    pub const SENSOR_DATA: &str = "sensor_data";
    pub const PREVIEW_FRAME: &str = "preview_frame";
    pub const FILE_INFO: &str = "file_info";
    pub const FILE_CHUNK: &str = "file_chunk";
    pub const FILE_END: &str = "file_end";
    pub const ACK: &str = "ack";
    pub const START_RECORD: &str = "start_record";
    pub const STOP_RECORD: &str = "stop_record";
    pub const FLASH_SYNC: &str = "flash_sync";
    pub const BEEP_SYNC: &str = "beep_sync";
}

const KNOWN_KINDS: [&str; 16] = [
    kinds::HELLO,
    kinds::HANDSHAKE,
    kinds::HANDSHAKE_ACK,
    kinds::HEARTBEAT,
    kinds::HEARTBEAT_RESPONSE,
    kinds::STATUS,
    kinds::SENSOR_DATA,
    kinds::PREVIEW_FRAME,
    kinds::FILE_INFO,
    kinds::FILE_CHUNK,
    kinds::FILE_END,
    kinds::ACK,
    kinds::START_RECORD,
    kinds::STOP_RECORD,
    kinds::FLASH_SYNC,
    kinds::BEEP_SYNC,
];

/// Kinds a registered device is expected to send.
const DEVICE_TO_HOST_KINDS: [&str; 9] = [
    kinds::HEARTBEAT,
    kinds::HEARTBEAT_RESPONSE,
    kinds::STATUS,
    kinds::SENSOR_DATA,
    kinds::PREVIEW_FRAME,
    kinds::FILE_INFO,
    kinds::FILE_CHUNK,
    kinds::FILE_END,
    kinds::ACK,
];

// ── Untyped wire unit ─────────────────────────────────────────────────────────

/// One immutable wire message.
///
/// `payload` never contains the `type` or `timestamp` keys; those live in
/// [`Message::kind`] and [`Message::timestamp`].
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message discriminator, e.g. `"sensor_data"`.
    pub kind: String,
    /// JSON-compatible payload fields.
    pub payload: Map<String, Value>,
    /// Sender clock in float seconds.  `0.0` when the sender omitted it.
    pub timestamp: f64,
}

impl Message {
    /// Creates a message stamped with the current wall-clock time.
    pub fn new(kind: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: now_secs(),
        }
    }

    /// Returns a copy of this message with an explicit sender timestamp.
    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Builds a message from a decoded JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MissingType`] if `type` is absent or not a string.
    pub fn from_object(mut object: Map<String, Value>) -> Result<Self, ProtocolError> {
        let kind = match object.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(ProtocolError::MissingType),
        };
        let timestamp = object
            .remove("timestamp")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        Ok(Self {
            kind,
            payload: object,
            timestamp,
        })
    }

    /// Flattens the message back into the JSON object written on the wire.
    pub fn to_object(&self) -> Map<String, Value> {
        let mut object = self.payload.clone();
        object.insert("type".to_string(), Value::String(self.kind.clone()));
        if let Some(ts) = serde_json::Number::from_f64(self.timestamp) {
            object.insert("timestamp".to_string(), Value::Number(ts));
        }
        object
    }

    /// Reads a string payload field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Reads a numeric payload field as `f64`.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(Value::as_f64)
    }
}

/// Returns the current wall-clock time as float seconds since the Unix epoch.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ── Outbound priority ─────────────────────────────────────────────────────────

/// Delivery priority for outbound messages.
///
/// Variants are declared lowest-first so the derived `Ord` puts
/// `Critical` at the top.  A sender drains the highest tier first and keeps
/// FIFO order inside one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    /// Bulk data that may wait (preview requests, file pulls).
    Low,
    /// Ordinary traffic.
    Normal,
    /// Liveness traffic (heartbeats and their replies).
    High,
    /// Control traffic (handshake acks, record commands, sync signals).
    Critical,
}

// ── Typed payloads ────────────────────────────────────────────────────────────

/// `hello` / `handshake` – first message a device sends after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Bearer token, required only when the host enforces authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
}

/// `handshake_ack` – host reply promoting the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub protocol_version: u32,
    pub compatible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `sensor_data` – one batch of named numeric readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
}

/// `preview_frame` – a low-resolution live image from a camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewFrame {
    #[serde(default = "default_frame_type")]
    pub frame_type: String,
    /// Base64-encoded image bytes, passed through untouched.
    #[serde(default)]
    pub image_data: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

/// `file_info` – opens a chunked file transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(alias = "filename")]
    pub name: String,
    #[serde(default)]
    pub size: u64,
    /// Hex SHA-256 of the whole file, when the device computed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// `file_chunk` – one sequenced, base64-encoded byte range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunk {
    #[serde(default, alias = "filename", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub data: String,
}

/// `file_end` – closes a chunked file transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEnd {
    #[serde(default, alias = "filename", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// `ack` – a device's reply to a host command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    #[serde(default)]
    pub cmd: String,
    #[serde(default = "default_ack_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CommandAck {
    /// `true` when the device reported a failure for the command.
    pub fn is_error(&self) -> bool {
        self.status.eq_ignore_ascii_case("error")
    }
}

/// `start_record` – host command carrying the modality flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRecord {
    pub session_id: String,
    #[serde(flatten)]
    pub options: RecordingOptions,
}

/// `stop_record` – host command ending the current recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// `flash_sync` – turn on the device flash for a shared visual marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashSync {
    #[serde(default = "default_sync_duration_ms")]
    pub duration_ms: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<String>,
}

/// `beep_sync` – play a tone for a shared audio marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeepSync {
    #[serde(default = "default_beep_frequency_hz")]
    pub frequency_hz: u32,
    #[serde(default = "default_sync_duration_ms")]
    pub duration_ms: u32,
    #[serde(default = "default_beep_volume")]
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<String>,
}

fn default_frame_type() -> String {
    "rgb".to_string()
}
fn default_ack_status() -> String {
    "ok".to_string()
}
fn default_sync_duration_ms() -> u32 {
    200
}
fn default_beep_frequency_hz() -> u32 {
    1000
}
fn default_beep_volume() -> f64 {
    0.8
}

// ── Typed message enum ────────────────────────────────────────────────────────

/// Closed set of known message kinds plus one escape hatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    Handshake(Handshake),
    HandshakeAck(HandshakeAck),
    Heartbeat,
    HeartbeatResponse,
    Status(DeviceStatus),
    SensorData(SensorReading),
    PreviewFrame(PreviewFrame),
    FileInfo(FileInfo),
    FileChunk(FileChunk),
    FileEnd(FileEnd),
    Ack(CommandAck),
    StartRecord(StartRecord),
    StopRecord(StopRecord),
    FlashSync(FlashSync),
    BeepSync(BeepSync),
    /// Unknown kind, or a known kind whose fields failed to parse.
    /// Carries the original message unchanged.
    Unrecognized(Message),
}

impl DeviceMessage {
    /// Classifies a wire message.  Never fails: anything that does not fit a
    /// known variant comes back as [`DeviceMessage::Unrecognized`].
    pub fn decode(message: Message) -> Self {
        let Message {
            kind,
            payload,
            timestamp,
        } = message;
        let body = Value::Object(payload);

        let typed = match kind.as_str() {
            kinds::HELLO | kinds::HANDSHAKE => typed(&body).map(Self::Handshake),
            kinds::HANDSHAKE_ACK => typed(&body).map(Self::HandshakeAck),
            kinds::HEARTBEAT => Some(Self::Heartbeat),
            kinds::HEARTBEAT_RESPONSE => Some(Self::HeartbeatResponse),
            kinds::STATUS => typed(&body).map(Self::Status),
            kinds::SENSOR_DATA => typed(&body).map(Self::SensorData),
            kinds::PREVIEW_FRAME => typed(&body).map(Self::PreviewFrame),
            kinds::FILE_INFO => typed(&body).map(Self::FileInfo),
            kinds::FILE_CHUNK => typed(&body).map(Self::FileChunk),
            kinds::FILE_END => typed(&body).map(Self::FileEnd),
            kinds::ACK => typed(&body).map(Self::Ack),
            kinds::START_RECORD => typed(&body).map(Self::StartRecord),
            kinds::STOP_RECORD => typed(&body).map(Self::StopRecord),
            kinds::FLASH_SYNC => typed(&body).map(Self::FlashSync),
            kinds::BEEP_SYNC => typed(&body).map(Self::BeepSync),
            _ => None,
        };

        match typed {
            Some(message) => message,
            None => {
                if KNOWN_KINDS.contains(&kind.as_str()) {
                    debug!("`{kind}` payload did not match its schema; forwarding as unrecognized");
                }
                let payload = match body {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                Self::Unrecognized(Message {
                    kind,
                    payload,
                    timestamp,
                })
            }
        }
    }

    /// Classifies a message received from an already-registered device.
    ///
    /// Only kinds a device is expected to send are typed.  Anything else,
    /// including a host command sent back by the device or a repeated
    /// handshake, comes back as [`DeviceMessage::Unrecognized`] with every
    /// field intact.
    pub fn decode_inbound(message: Message) -> Self {
        if DEVICE_TO_HOST_KINDS.contains(&message.kind.as_str()) {
            Self::decode(message)
        } else {
            Self::Unrecognized(message)
        }
    }

    /// Returns the wire discriminator for this variant.
    pub fn kind(&self) -> &str {
        match self {
            Self::Handshake(_) => kinds::HANDSHAKE,
            Self::HandshakeAck(_) => kinds::HANDSHAKE_ACK,
            Self::Heartbeat => kinds::HEARTBEAT,
            Self::HeartbeatResponse => kinds::HEARTBEAT_RESPONSE,
            Self::Status(_) => kinds::STATUS,
            Self::SensorData(_) => kinds::SENSOR_DATA,
            Self::PreviewFrame(_) => kinds::PREVIEW_FRAME,
            Self::FileInfo(_) => kinds::FILE_INFO,
            Self::FileChunk(_) => kinds::FILE_CHUNK,
            Self::FileEnd(_) => kinds::FILE_END,
            Self::Ack(_) => kinds::ACK,
            Self::StartRecord(_) => kinds::START_RECORD,
            Self::StopRecord(_) => kinds::STOP_RECORD,
            Self::FlashSync(_) => kinds::FLASH_SYNC,
            Self::BeepSync(_) => kinds::BEEP_SYNC,
            Self::Unrecognized(message) => &message.kind,
        }
    }

    /// Encodes this variant as a wire message stamped with the current time.
    pub fn to_message(&self) -> Message {
        let payload = match self {
            Self::Handshake(m) => to_payload(m),
            Self::HandshakeAck(m) => to_payload(m),
            Self::Heartbeat | Self::HeartbeatResponse => Map::new(),
            Self::Status(m) => to_payload(m),
            Self::SensorData(m) => to_payload(m),
            Self::PreviewFrame(m) => to_payload(m),
            Self::FileInfo(m) => to_payload(m),
            Self::FileChunk(m) => to_payload(m),
            Self::FileEnd(m) => to_payload(m),
            Self::Ack(m) => to_payload(m),
            Self::StartRecord(m) => to_payload(m),
            Self::StopRecord(m) => to_payload(m),
            Self::FlashSync(m) => to_payload(m),
            Self::BeepSync(m) => to_payload(m),
            Self::Unrecognized(message) => return message.clone(),
        };
        Message::new(self.kind(), payload)
    }
}

fn typed<T: DeserializeOwned>(body: &Value) -> Option<T> {
    T::deserialize(body).ok()
}

fn to_payload<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
