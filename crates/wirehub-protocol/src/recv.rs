//! Contiguous, compacting receive buffer and frame scanning.
//!
//! Unlike the outbound [`BufferChain`](crate::buffer::BufferChain), a
//! connection's inbound side is one contiguous buffer: frames must be
//! handed to handlers as unbroken slices. The buffer is compacted after
//! every scan so its footprint tracks the largest single burst rather
//! than the lifetime of the connection.

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};

use wirehub_core::{constants::HEADER_SIZE, error::Result};

/// What the scanner sees at the current consumed offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// Fewer than four unconsumed bytes; wait for more input.
    NeedHeader,
    /// Header present but the payload is incomplete.
    NeedBody {
        /// Bytes still missing before the frame is whole.
        need: usize,
    },
    /// A complete frame is buffered.
    Ready {
        /// Message tag from the header.
        tag: u16,
        /// Payload length from the header.
        len: usize,
    },
    /// The header declares a payload beyond the configured cap; the
    /// connection must be closed without dispatching.
    TooLarge {
        /// The declared payload length.
        len: usize,
    },
}

/// Growable receive buffer with a consumed offset.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    data: Vec<u8>,
    consumed: usize,
}

impl RecvBuffer {
    /// Creates an empty buffer.
    pub fn new() -> RecvBuffer {
        RecvBuffer::default()
    }

    /// Count of buffered, not-yet-scanned bytes.
    pub fn buffered(&self) -> usize {
        self.data.len() - self.consumed
    }

    /// Inspects the next frame at the consumed offset, bounding the
    /// declared payload by `limit`.
    pub fn peek(&self, limit: usize) -> FrameStatus {
        let avail = self.buffered();
        if avail < HEADER_SIZE {
            return FrameStatus::NeedHeader;
        }
        let len = LittleEndian::read_u16(&self.data[self.consumed..self.consumed + 2]) as usize;
        if len > limit {
            return FrameStatus::TooLarge { len };
        }
        if avail < HEADER_SIZE + len {
            return FrameStatus::NeedBody { need: HEADER_SIZE + len - avail };
        }
        let tag = LittleEndian::read_u16(&self.data[self.consumed + 2..self.consumed + 4]);
        FrameStatus::Ready { tag, len }
    }

    /// The payload of the frame at the consumed offset. Only valid after
    /// [`peek`](Self::peek) returned `Ready` with this `len`.
    pub fn payload(&self, len: usize) -> &[u8] {
        &self.data[self.consumed + HEADER_SIZE..self.consumed + HEADER_SIZE + len]
    }

    /// Marks the frame at the consumed offset (header plus `len` payload
    /// bytes) as scanned.
    pub fn advance(&mut self, len: usize) {
        self.consumed += HEADER_SIZE + len;
        debug_assert!(self.consumed <= self.data.len());
    }

    /// Shifts unconsumed bytes to the front and resets the offset.
    pub fn compact(&mut self) {
        if self.consumed == 0 {
            return;
        }
        let remaining = self.buffered();
        self.data.copy_within(self.consumed.., 0);
        self.data.truncate(remaining);
        self.consumed = 0;
    }

    /// Appends raw bytes, growing the buffer fallibly.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<()> {
        self.data.try_reserve(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Ensures at least `n` writable bytes beyond the current contents.
    pub fn reserve_spare(&mut self, n: usize) -> Result<()> {
        self.data.try_reserve(n)?;
        Ok(())
    }

    /// Reads up to `max` bytes from `src` into the buffer. Returns the
    /// byte count (0 means end-of-stream); would-block surfaces as the
    /// raw `io::Error` for the caller to interpret.
    pub fn read_from(&mut self, src: &mut impl Read, max: usize) -> Result<usize> {
        self.data.try_reserve(max)?;
        let start = self.data.len();
        self.data.resize(start + max, 0);
        match src.read(&mut self.data[start..]) {
            Ok(n) => {
                self.data.truncate(start + n);
                Ok(n)
            }
            Err(err) => {
                self.data.truncate(start);
                Err(err.into())
            }
        }
    }

    /// The whole unconsumed region, ignoring frame structure.
    pub fn unconsumed(&self) -> &[u8] {
        &self.data[self.consumed..]
    }

    pub(crate) fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;

    #[test]
    fn test_peek_empty_needs_header() {
        let rb = RecvBuffer::new();
        assert_eq!(rb.peek(2048), FrameStatus::NeedHeader);
    }

    #[test]
    fn test_peek_partial_header() {
        let mut rb = RecvBuffer::new();
        rb.extend(&[5, 0, 2]).unwrap();
        assert_eq!(rb.peek(2048), FrameStatus::NeedHeader);
    }

    #[test]
    fn test_peek_partial_body() {
        let mut rb = RecvBuffer::new();
        let frame = encode_frame(7, b"abcdef").unwrap();
        rb.extend(&frame[..7]).unwrap();
        assert_eq!(rb.peek(2048), FrameStatus::NeedBody { need: 3 });
    }

    #[test]
    fn test_peek_complete_frame() {
        let mut rb = RecvBuffer::new();
        rb.extend(&encode_frame(7, b"abcdef").unwrap()).unwrap();
        assert_eq!(rb.peek(2048), FrameStatus::Ready { tag: 7, len: 6 });
        assert_eq!(rb.payload(6), b"abcdef");
    }

    #[test]
    fn test_peek_oversized_length() {
        let mut rb = RecvBuffer::new();
        // header declaring a 65000 byte payload, far past the cap
        rb.extend(&[0xe8, 0xfd, 0x02, 0x00]).unwrap();
        assert_eq!(rb.peek(2048), FrameStatus::TooLarge { len: 65000 });
    }

    #[test]
    fn test_advance_and_compact() {
        let mut rb = RecvBuffer::new();
        rb.extend(&encode_frame(1, b"xy").unwrap()).unwrap();
        rb.extend(&encode_frame(2, b"z").unwrap()).unwrap();
        match rb.peek(2048) {
            FrameStatus::Ready { tag, len } => {
                assert_eq!(tag, 1);
                rb.advance(len);
            }
            other => panic!("unexpected status {:?}", other),
        }
        rb.compact();
        assert_eq!(rb.buffered(), 5);
        assert_eq!(rb.peek(2048), FrameStatus::Ready { tag: 2, len: 1 });
        assert_eq!(rb.payload(1), b"z");
    }

    #[test]
    fn test_read_from_stops_at_source_end() {
        let mut rb = RecvBuffer::new();
        let mut src: &[u8] = b"abc";
        let n = rb.read_from(&mut src, 16).unwrap();
        assert_eq!(n, 3);
        assert_eq!(rb.buffered(), 3);
        let n = rb.read_from(&mut src, 16).unwrap();
        assert_eq!(n, 0);
    }
}
