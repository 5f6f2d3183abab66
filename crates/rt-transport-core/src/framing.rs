//! Framing/length-prefix filter (spec.md §4.7).
//!
//! The default framer prepends a 4-byte big-endian unsigned length to each
//! codec-encoded frame. The receiving side feeds arbitrary byte chunks (as
//! they arrive off the wire) into a `FrameAccumulator`, which yields
//! complete frames as they become available and fails the connection if the
//! accumulation buffer grows past `max_buffer_size_bytes`.

use crate::error::FramingError;
use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use tokio::sync::mpsc;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Prepend the 4-byte big-endian length prefix to an already-encoded frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Bounded accumulation buffer for length-prefixed frames arriving over a
/// byte-oriented connection. One instance per connection.
pub struct FrameAccumulator {
    buf: BytesMut,
    max_size: usize,
}

impl FrameAccumulator {
    pub fn new(max_size: usize) -> Self {
        FrameAccumulator {
            buf: BytesMut::new(),
            max_size,
        }
    }

    /// Feed newly-received bytes in; returns every frame that became
    /// complete as a result, in arrival order.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, FramingError> {
        self.buf.extend_from_slice(data);
        if self.buf.len() > self.max_size {
            return Err(FramingError::BufferOverflow {
                limit: self.max_size,
            });
        }

        let mut frames = Vec::new();
        loop {
            if self.buf.len() < LENGTH_PREFIX_BYTES {
                break;
            }
            let len = u32::from_be_bytes(self.buf[..LENGTH_PREFIX_BYTES].try_into().unwrap()) as usize;
            if self.buf.len() < LENGTH_PREFIX_BYTES + len {
                break;
            }
            self.buf.advance(LENGTH_PREFIX_BYTES);
            let frame = self.buf.split_to(len);
            frames.push(frame.to_vec());
        }
        Ok(frames)
    }
}

/// Wraps a carrier's raw inbound byte channel with a `FrameAccumulator` and a
/// small pending queue, so callers can pull one decoded frame at a time
/// regardless of how the carrier chunked them. Used both for the single
/// handshake-response frame (read under a timeout) and for the steady-state
/// per-connection read loop afterward — same reader, same ordering.
pub struct FramedReader {
    inbound: mpsc::Receiver<Vec<u8>>,
    accumulator: FrameAccumulator,
    pending: VecDeque<Vec<u8>>,
}

impl FramedReader {
    pub fn new(inbound: mpsc::Receiver<Vec<u8>>, max_size: usize) -> Self {
        FramedReader {
            inbound,
            accumulator: FrameAccumulator::new(max_size),
            pending: VecDeque::new(),
        }
    }

    /// Returns the next complete frame, or `None` once the carrier's channel
    /// has closed (connection dropped) with no further frames pending.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }
        while let Some(chunk) = self.inbound.recv().await {
            let frames = self.accumulator.push(&chunk)?;
            self.pending.extend(frames);
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_frame_delivered_whole() {
        let mut acc = FrameAccumulator::new(1024);
        let frame = encode_frame(b"hello");
        let frames = acc.push(&frame).unwrap();
        assert_eq!(frames, vec![b"hello".to_vec()]);
        assert!(acc.push(&[]).unwrap().is_empty());
    }

    #[test]
    fn reassembles_a_frame_split_across_several_pushes() {
        let mut acc = FrameAccumulator::new(1024);
        let frame = encode_frame(b"split-across-chunks");
        let (a, b) = frame.split_at(3);
        assert!(acc.push(a).unwrap().is_empty());
        let frames = acc.push(b).unwrap();
        assert_eq!(frames, vec![b"split-across-chunks".to_vec()]);
    }

    #[test]
    fn extracts_multiple_frames_delivered_in_one_chunk() {
        let mut acc = FrameAccumulator::new(1024);
        let mut combined = encode_frame(b"one");
        combined.extend(encode_frame(b"two"));
        let frames = acc.push(&combined).unwrap();
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn overflow_is_fatal() {
        let mut acc = FrameAccumulator::new(8);
        let err = acc.push(&[0u8; 9]).unwrap_err();
        assert!(matches!(err, FramingError::BufferOverflow { limit: 8 }));
    }

    #[tokio::test]
    async fn framed_reader_yields_frames_in_order_then_none_on_close() {
        let (tx, rx) = mpsc::channel(4);
        let mut combined = encode_frame(b"one");
        combined.extend(encode_frame(b"two"));
        tx.send(combined).await.unwrap();
        drop(tx);

        let mut reader = FramedReader::new(rx, 1024);
        assert_eq!(reader.next_frame().await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(reader.next_frame().await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }
}
