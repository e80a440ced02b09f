//! Wire frame encoding.
//!
//! A frame is the decimal byte length of the payload, a `;` delimiter, then
//! the payload verbatim:
//!
//! ```text
//! ┌──────────────┬───┬─────────────────┐
//! │ "15"         │ ; │ {"type":"PING"} │
//! │ ASCII digits │   │ <length> bytes  │
//! └──────────────┴───┴─────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use homewire::protocol::encode;
//!
//! let bytes = encode(b"hello");
//! assert_eq!(&bytes[..], b"5;hello");
//! ```

use bytes::{BufMut, Bytes, BytesMut};

/// Byte separating the length header from the payload.
pub const DELIMITER: u8 = b';';

/// Longest accepted length header (fits any `u32`).
pub const MAX_HEADER_DIGITS: usize = 10;

/// Header bytes (digits + delimiter) needed for a payload of `payload_len`.
#[inline]
pub fn header_len(payload_len: usize) -> usize {
    decimal_digits(payload_len) + 1
}

/// Total frame size for a payload of `payload_len`.
#[inline]
pub fn frame_len(payload_len: usize) -> usize {
    header_len(payload_len) + payload_len
}

/// Frame a payload into a single contiguous buffer.
pub fn encode(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(frame_len(payload.len()));
    encode_into(payload, &mut buf);
    buf.freeze()
}

/// Append a framed payload to an existing buffer.
pub fn encode_into(payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(frame_len(payload.len()));
    buf.put_slice(payload.len().to_string().as_bytes());
    buf.put_u8(DELIMITER);
    buf.put_slice(payload);
}

/// Parse the span before the delimiter as a payload length.
///
/// Only plain ASCII digits are accepted: no sign, whitespace or empty span.
pub fn parse_length(header: &[u8]) -> Option<usize> {
    if header.is_empty() || header.len() > MAX_HEADER_DIGITS {
        return None;
    }
    if !header.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(header).ok()?.parse().ok()
}

fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}
