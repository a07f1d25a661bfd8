//! # capsync-core
//!
//! Shared library for the CapSync capture host containing the wire message
//! model, the length-prefixed frame codec, and the domain entities that the
//! host application builds on.
//!
//! It has zero dependencies on sockets, async runtimes, or OS APIs.
//!
//! # Architecture overview (for beginners)
//!
//! CapSync coordinates a number of remote capture devices (phones and tablets
//! with cameras, thermal sensors, and body-worn sensors) from one controlling
//! host.  The host tells every device to start and stop recording at the same
//! moment, collects live sensor data, and pulls recorded files back.
//!
//! This crate (`capsync-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel over the network.  Every message is a
//!   UTF-8 JSON object prefixed by a 4-byte big-endian length.  The codec turns
//!   frames into [`Message`] values and the typed [`DeviceMessage`] enum gives
//!   each known message kind its own variant.
//!
//! - **`domain`** – Pure business types with no I/O: recording sessions,
//!   sensor samples, connection states, performance levels, and link-quality
//!   statistics.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `capsync_core::Message` instead of `capsync_core::protocol::messages::Message`.
pub use domain::device::{DeviceConnectionState, DeviceId, DeviceStatus};
pub use domain::link::{LinkStats, LinkSummary};
pub use domain::performance::{PerformanceLevel, QualityTier};
pub use domain::session::{RecordingOptions, SensorSample, Session, SessionHistory};
pub use protocol::codec::{decode_frame, encode_frame, ProtocolError, MAX_FRAME_SIZE};
pub use protocol::messages::{DeviceMessage, Message, MessagePriority};
