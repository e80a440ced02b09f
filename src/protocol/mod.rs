//! Protocol module - wire framing, packet vocabulary and message envelopes.
//!
//! This module implements the client-facing protocol:
//! - `<decimal-length>;<payload>` frame encoding
//! - Frame buffer for reassembling fragmented or batched reads
//! - Command vocabulary (`PING`, `INFO`, `SET`, `GET`, `ERROR`)
//! - JSON message envelopes

mod command;
mod frame;
mod frame_buffer;
mod message;

pub use command::Command;
pub use frame::{
    encode, encode_into, frame_len, header_len, parse_length, DELIMITER, MAX_HEADER_DIGITS,
};
pub use frame_buffer::{FrameBuffer, Frames, DEFAULT_STALE_AFTER};
pub use message::{ErrorReply, Inbound, Outbound, Reply, SERVER_IDENTITY};
