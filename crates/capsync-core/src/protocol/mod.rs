//! Protocol module containing the wire message model, the frame codec, and
//! the sequence counter used for FIFO ordering.

pub mod codec;
pub mod messages;
pub mod sequence;

pub use codec::{decode_frame, encode_frame, ProtocolError, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
pub use messages::*;
pub use sequence::SequenceCounter;
