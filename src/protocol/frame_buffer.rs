//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` with a hard capacity `C` per client.
//! Implements a state machine for handling fragmented and batched frames:
//! - `WaitingForHeader`: scanning for the `;` delimiter
//! - `WaitingForBody`: length known, need `header + body` bytes buffered
//! - `Skipping`: discarding the body of a frame that can never fit
//!
//! # Discard rules
//!
//! - Bytes arriving while the accumulator is full are dropped (soft fail).
//! - A header span that is not plain decimal digits is discarded up to and
//!   including its delimiter; parsing resumes on the following byte.
//! - A declared frame larger than `C` is dropped: its header is discarded and
//!   exactly `length` following bytes are skipped.
//! - An accumulator that reaches `C` bytes without any delimiter is a
//!   [`FrameError::HeaderOverflow`]; the caller should close the connection.
//! - A gap longer than the staleness threshold between two receipts abandons
//!   any partial frame; the new bytes start a fresh one.
//!
//! # Example
//!
//! ```
//! use std::time::Instant;
//! use homewire::protocol::{encode, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new(2048);
//! let wire = encode(br#"{"type":"PING"}"#);
//! let now = Instant::now();
//!
//! assert_eq!(buffer.feed(&wire[..4], now).count(), 0);
//! let frames: Vec<_> = buffer.feed(&wire[4..], now).collect();
//! assert_eq!(frames.len(), 1);
//! ```

use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};

use super::frame::{parse_length, DELIMITER};
use crate::error::FrameError;

/// Default gap after which a partially received frame is abandoned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_millis(1500);

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Length not yet known.
    WaitingForHeader,
    /// Header parsed; the frame is complete once `header_len + body_len` bytes are buffered.
    WaitingForBody { header_len: usize, body_len: usize },
    /// Dropping the body of an oversized frame.
    Skipping { remaining: usize },
}

/// Per-client receive accumulator.
#[derive(Debug)]
pub struct FrameBuffer {
    /// Accumulated bytes, never longer than `capacity`.
    buffer: BytesMut,
    /// Fixed accumulator capacity `C`.
    capacity: usize,
    /// Current parsing state.
    state: State,
    /// Maximum inter-receipt gap before a partial frame is abandoned.
    stale_after: Duration,
    /// Time of the previous `feed`.
    last_receipt: Option<Instant>,
    /// Bytes dropped because the accumulator was full.
    dropped_bytes: usize,
    /// Header spans discarded as malformed.
    malformed_headers: usize,
}

impl FrameBuffer {
    /// Create a frame buffer with capacity `C` and the default staleness threshold.
    pub fn new(capacity: usize) -> Self {
        Self::with_stale_after(capacity, DEFAULT_STALE_AFTER)
    }

    /// Create a frame buffer with a custom staleness threshold.
    pub fn with_stale_after(capacity: usize, stale_after: Duration) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            capacity,
            state: State::WaitingForHeader,
            stale_after,
            last_receipt: None,
            dropped_bytes: 0,
            malformed_headers: 0,
        }
    }

    /// Push received bytes and lazily extract every complete payload.
    ///
    /// The returned iterator yields zero or more payloads (more than one when
    /// the peer batched frames) and stops after the first [`FrameError`].
    /// Bytes are appended eagerly; frames are sliced out as the iterator is
    /// driven, so dropping it early leaves them buffered for the next call.
    pub fn feed(&mut self, data: &[u8], now: Instant) -> Frames<'_> {
        if let Some(last) = self.last_receipt {
            let gap = now.saturating_duration_since(last);
            if gap > self.stale_after && self.has_partial() {
                tracing::debug!(
                    "Abandoning partial frame after {:?} gap ({} bytes buffered)",
                    gap,
                    self.buffer.len()
                );
                self.reset();
            }
        }
        self.last_receipt = Some(now);

        let mut data = data;
        if let State::Skipping { remaining } = self.state {
            let n = remaining.min(data.len());
            data = &data[n..];
            self.state = if remaining == n {
                State::WaitingForHeader
            } else {
                State::Skipping {
                    remaining: remaining - n,
                }
            };
        }

        let room = self.capacity - self.buffer.len();
        let take = room.min(data.len());
        self.buffer.extend_from_slice(&data[..take]);

        if take < data.len() {
            let dropped = data.len() - take;
            self.dropped_bytes += dropped;
            tracing::warn!(
                "Receive buffer full ({} bytes), dropped {} bytes",
                self.capacity,
                dropped
            );
        }

        Frames {
            buffer: self,
            failed: false,
        }
    }

    /// Try to extract a single payload from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(payload))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if the accumulator is full and holds no header
    fn try_extract_one(&mut self) -> Result<Option<Bytes>, FrameError> {
        loop {
            match self.state {
                State::WaitingForHeader => {
                    let Some(pos) = self.buffer.iter().position(|&b| b == DELIMITER) else {
                        if self.buffer.len() >= self.capacity {
                            let capacity = self.capacity;
                            self.reset();
                            return Err(FrameError::HeaderOverflow { capacity });
                        }
                        return Ok(None);
                    };

                    let Some(body_len) = parse_length(&self.buffer[..pos]) else {
                        self.malformed_headers += 1;
                        tracing::warn!("Discarding malformed frame header ({} bytes)", pos);
                        self.buffer.advance(pos + 1);
                        continue;
                    };

                    let header_len = pos + 1;
                    if header_len + body_len > self.capacity {
                        tracing::warn!(
                            "Dropping frame of {} bytes (capacity {})",
                            header_len + body_len,
                            self.capacity
                        );
                        self.buffer.advance(header_len);
                        self.state = State::Skipping {
                            remaining: body_len,
                        };
                        continue;
                    }

                    self.state = State::WaitingForBody {
                        header_len,
                        body_len,
                    };
                }

                State::WaitingForBody {
                    header_len,
                    body_len,
                } => {
                    if self.buffer.len() < header_len + body_len {
                        return Ok(None);
                    }

                    self.buffer.advance(header_len);
                    let payload = self.buffer.split_to(body_len).freeze();
                    self.state = State::WaitingForHeader;
                    return Ok(Some(payload));
                }

                State::Skipping { remaining } => {
                    let n = remaining.min(self.buffer.len());
                    self.buffer.advance(n);
                    if remaining == n {
                        self.state = State::WaitingForHeader;
                        continue;
                    }
                    self.state = State::Skipping {
                        remaining: remaining - n,
                    };
                    return Ok(None);
                }
            }
        }
    }

    /// Total frame size (header + delimiter + body) once the header is parsed.
    pub fn declared_frame_length(&self) -> Option<usize> {
        match self.state {
            State::WaitingForBody {
                header_len,
                body_len,
            } => Some(header_len + body_len),
            _ => None,
        }
    }

    /// Bytes consumed by the length prefix and delimiter once the header is parsed.
    pub fn header_length(&self) -> Option<usize> {
        match self.state {
            State::WaitingForBody { header_len, .. } => Some(header_len),
            _ => None,
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Fixed accumulator capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes dropped so far because the accumulator was full.
    pub fn dropped_bytes(&self) -> usize {
        self.dropped_bytes
    }

    /// Header spans discarded so far as malformed.
    pub fn malformed_headers(&self) -> usize {
        self.malformed_headers
    }

    /// Clear the buffer and reset state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    fn has_partial(&self) -> bool {
        !self.buffer.is_empty() || self.state != State::WaitingForHeader
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
            State::Skipping { .. } => "Skipping",
        }
    }
}

/// Lazy sequence of payloads produced by [`FrameBuffer::feed`].
pub struct Frames<'a> {
    buffer: &'a mut FrameBuffer,
    failed: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Bytes, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.buffer.try_extract_one() {
            Ok(Some(payload)) => Some(Ok(payload)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;

    fn collect(buffer: &mut FrameBuffer, data: &[u8], now: Instant) -> Vec<Bytes> {
        buffer
            .feed(data, now)
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new(2048);
        let frames = collect(&mut buffer, &encode(b"hello"), Instant::now());

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"hello");
        assert!(buffer.is_empty());
        assert_eq!(buffer.declared_frame_length(), None);
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new(2048);
        let mut combined = Vec::new();
        combined.extend_from_slice(&encode(b"first"));
        combined.extend_from_slice(&encode(b"second"));
        combined.extend_from_slice(&encode(b"third"));

        let frames = collect(&mut buffer, &combined, Instant::now());

        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], b"first");
        assert_eq!(&frames[1][..], b"second");
        assert_eq!(&frames[2][..], b"third");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_header() {
        let mut buffer = FrameBuffer::new(2048);
        let payload = vec![b'a'; 120];
        let bytes = encode(&payload);
        let now = Instant::now();

        assert!(collect(&mut buffer, &bytes[..2], now).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");

        assert!(collect(&mut buffer, &bytes[2..4], now).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForBody");
        assert_eq!(buffer.declared_frame_length(), Some(4 + 120));
        assert_eq!(buffer.header_length(), Some(4));

        let frames = collect(&mut buffer, &bytes[4..], now);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 120);
    }

    #[test]
    fn test_fragmented_body() {
        let mut buffer = FrameBuffer::new(2048);
        let payload = b"this is a longer payload that will be fragmented";
        let bytes = encode(payload);
        let now = Instant::now();

        assert!(collect(&mut buffer, &bytes[..10], now).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForBody");

        let frames = collect(&mut buffer, &bytes[10..], now);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], payload);
    }

    #[test]
    fn test_empty_payload() {
        let mut buffer = FrameBuffer::new(64);
        let frames = collect(&mut buffer, b"0;", Instant::now());

        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new(64);
        let bytes = encode(b"hi there");
        let now = Instant::now();

        let mut all = Vec::new();
        for byte in bytes.iter() {
            all.extend(collect(&mut buffer, &[*byte], now));
        }

        assert_eq!(all.len(), 1);
        assert_eq!(&all[0][..], b"hi there");
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut buffer = FrameBuffer::new(2048);
        let frame2 = encode(b"second");
        let mut data = encode(b"first").to_vec();
        data.extend_from_slice(&frame2[..3]);
        let now = Instant::now();

        let frames = collect(&mut buffer, &data, now);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"first");

        let frames = collect(&mut buffer, &frame2[3..], now);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"second");
    }

    #[test]
    fn test_stale_gap_abandons_partial_frame() {
        let mut buffer = FrameBuffer::new(2048);
        let stale = encode(b"never finished");
        let fresh = encode(b"fresh");
        let t0 = Instant::now();

        assert!(collect(&mut buffer, &stale[..6], t0).is_empty());
        assert!(buffer.declared_frame_length().is_some());

        let later = t0 + Duration::from_millis(1600);
        let frames = collect(&mut buffer, &fresh, later);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"fresh");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_gap_within_threshold_keeps_partial_frame() {
        let mut buffer = FrameBuffer::new(2048);
        let bytes = encode(b"slow but steady");
        let t0 = Instant::now();

        assert!(collect(&mut buffer, &bytes[..5], t0).is_empty());
        let frames = collect(&mut buffer, &bytes[5..], t0 + Duration::from_millis(1400));
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_malformed_header_is_discarded() {
        let mut buffer = FrameBuffer::new(2048);
        let mut data = b"abc;".to_vec();
        data.extend_from_slice(&encode(b"ok"));

        let frames = collect(&mut buffer, &data, Instant::now());
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"ok");
        assert_eq!(buffer.malformed_headers(), 1);
    }

    #[test]
    fn test_empty_header_is_discarded() {
        let mut buffer = FrameBuffer::new(2048);
        let frames = collect(&mut buffer, b";2;ok", Instant::now());
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"ok");
    }

    #[test]
    fn test_oversized_frame_is_skipped() {
        let mut buffer = FrameBuffer::new(32);
        let now = Instant::now();
        let big = vec![b'x'; 40];

        let mut data = b"40;".to_vec();
        data.extend_from_slice(&big[..20]);
        assert!(collect(&mut buffer, &data, now).is_empty());
        assert_eq!(buffer.state_name(), "Skipping");

        let mut rest = big[20..].to_vec();
        rest.extend_from_slice(&encode(b"next"));
        let frames = collect(&mut buffer, &rest, now);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"next");
    }

    #[test]
    fn test_overflow_without_header_fails() {
        let mut buffer = FrameBuffer::new(16);
        let results: Vec<_> = buffer.feed(&[b'7'; 20], Instant::now()).collect();

        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0],
            Err(FrameError::HeaderOverflow { capacity: 16 })
        );
        assert_eq!(buffer.dropped_bytes(), 4);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_bytes_beyond_capacity_are_dropped() {
        let mut buffer = FrameBuffer::new(16);
        let now = Instant::now();
        let mut data = encode(b"0123456789").to_vec();
        data.extend_from_slice(b"trailing-garbage");

        let frames: Vec<_> = buffer.feed(&data, now).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(buffer.dropped_bytes(), data.len() - 16);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut buffer = FrameBuffer::new(2048);
        let bytes = encode(b"partial");
        let _ = collect(&mut buffer, &bytes[..4], Instant::now());
        assert_eq!(buffer.state_name(), "WaitingForBody");

        buffer.reset();

        assert_eq!(buffer.state_name(), "WaitingForHeader");
        assert!(buffer.is_empty());
    }

    proptest::proptest! {
        #[test]
        fn prop_split_points_do_not_change_frames(
            payloads in proptest::collection::vec(proptest::collection::vec(proptest::num::u8::ANY, 0..200), 1..6),
            cuts in proptest::collection::vec(1usize..64, 0..40),
        ) {
            let mut wire = Vec::new();
            for p in &payloads {
                wire.extend_from_slice(&encode(p));
            }

            let mut buffer = FrameBuffer::new(2048);
            let now = Instant::now();
            let mut frames = Vec::new();
            let mut rest = &wire[..];
            for cut in cuts {
                let n = cut.min(rest.len());
                frames.extend(collect(&mut buffer, &rest[..n], now));
                rest = &rest[n..];
            }
            frames.extend(collect(&mut buffer, rest, now));

            let frames: Vec<Vec<u8>> = frames.iter().map(|f| f.to_vec()).collect();
            proptest::prop_assert_eq!(frames, payloads);
            proptest::prop_assert!(buffer.is_empty());
        }
    }
}
