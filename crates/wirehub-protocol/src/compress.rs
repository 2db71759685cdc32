//! Streaming zlib contexts for peer-server links.
//!
//! Each direction of a server link owns persistent compression state for
//! the lifetime of the link: the byte stream is one long zlib stream, not
//! per-frame envelopes. Outbound, plaintext accumulates in a pending
//! chain and is compressed into ciphertext nodes in batches; inbound,
//! arbitrary-sized ciphertext chunks inflate straight into the receive
//! buffer.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use wirehub_core::{
    constants::{NODE_CAPACITY, RECV_GROW},
    error::{ErrorKind, Result},
};

use crate::{
    buffer::{BufferChain, BufferNode},
    recv::RecvBuffer,
};

/// Persistent deflate state for one link's outbound direction.
pub struct LinkCompressor {
    zout: Compress,
}

impl std::fmt::Debug for LinkCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkCompressor").field("total_in", &self.zout.total_in()).finish()
    }
}

impl LinkCompressor {
    /// Creates a compressor at the given zlib level (0-9).
    pub fn new(level: u32) -> LinkCompressor {
        LinkCompressor { zout: Compress::new(Compression::new(level), true) }
    }

    /// Compresses plaintext from `pending` into ciphertext nodes appended
    /// to `out`, until the pending chain is empty or `out` holds at least
    /// `target` bytes. The final queued node is flushed with a sync flush
    /// so a partial application message is never withheld indefinitely.
    pub fn compress_chain(
        &mut self,
        pending: &mut BufferChain,
        out: &mut BufferChain,
        target: usize,
    ) -> Result<()> {
        while !pending.is_empty() && out.size() < target {
            self.compress_head(pending, out)?;
        }
        Ok(())
    }

    /// Compresses the head node of `pending`, emitting zero or more full
    /// ciphertext nodes onto `out`.
    fn compress_head(&mut self, pending: &mut BufferChain, out: &mut BufferChain) -> Result<()> {
        // a sync flush on the last queued node forces everything buffered
        // inside the deflate state out onto the wire
        let sync = pending.is_single_node();
        let flush = if sync { FlushCompress::Sync } else { FlushCompress::None };

        let mut ate = 0usize;
        let mut emitted: Vec<BufferNode> = Vec::new();
        {
            let head = match pending.head() {
                Some(head) => head,
                None => return Ok(()),
            };
            loop {
                let mut node = BufferNode::with_capacity(NODE_CAPACITY)?;
                let before_in = self.zout.total_in();
                let status = self
                    .zout
                    .compress_vec(&head[ate..], node.data_mut(), flush)
                    .map_err(|err| ErrorKind::Compress(err.to_string()))?;
                ate += (self.zout.total_in() - before_in) as usize;
                let full = node.is_full();
                emitted.push(node);
                match status {
                    Status::Ok => {}
                    // no further progress possible with this input
                    Status::BufError => break,
                    Status::StreamEnd => {
                        return Err(ErrorKind::Compress("deflate stream ended".to_owned()))
                    }
                }
                // only a sync flush is obliged to drain every buffered
                // byte; without one, deflate may keep input internal
                if !(full && sync) {
                    break;
                }
            }
        }
        if ate == 0 && emitted.iter().all(BufferNode::is_empty) {
            return Err(ErrorKind::Compress("deflate made no progress".to_owned()));
        }
        pending.consume(ate);
        for node in emitted {
            out.append_node(node);
        }
        Ok(())
    }
}

/// Persistent inflate state for one link's inbound direction.
pub struct LinkDecompressor {
    zin: Decompress,
}

impl std::fmt::Debug for LinkDecompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkDecompressor").field("total_in", &self.zin.total_in()).finish()
    }
}

impl Default for LinkDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkDecompressor {
    /// Creates a decompressor expecting a zlib stream.
    pub fn new() -> LinkDecompressor {
        LinkDecompressor { zin: Decompress::new(true) }
    }

    /// Inflates one raw chunk of arbitrary size into `recv`, growing the
    /// buffer in fixed increments whenever output space runs out before
    /// the chunk is fully consumed. A decode error is fatal to the link.
    pub fn decompress_into(&mut self, mut input: &[u8], recv: &mut RecvBuffer) -> Result<()> {
        while !input.is_empty() {
            recv.reserve_spare(RECV_GROW)?;
            let before_in = self.zin.total_in();
            let before_len = recv.len();
            let status = self
                .zin
                .decompress_vec(input, recv.data_mut(), FlushDecompress::Sync)
                .map_err(|err| ErrorKind::Decompress(err.to_string()))?;
            let ate = (self.zin.total_in() - before_in) as usize;
            let wrote = recv.len() - before_len;
            input = &input[ate..];
            match status {
                Status::Ok | Status::BufError if ate > 0 || wrote > 0 => {}
                Status::Ok | Status::BufError => {
                    return Err(ErrorKind::Decompress("inflate made no progress".to_owned()))
                }
                Status::StreamEnd => {
                    return Err(ErrorKind::Decompress("unexpected end of stream".to_owned()))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(chain: &mut BufferChain) -> Vec<u8> {
        let mut bytes = Vec::new();
        while let Some(head) = chain.head() {
            bytes.extend_from_slice(head);
            let n = head.len();
            chain.consume(n);
        }
        bytes
    }

    fn pseudo_random(len: usize) -> Vec<u8> {
        let mut state = 0x2545f491u32;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 24) as u8
            })
            .collect()
    }

    fn round_trip(plain: &[u8], chunk: usize) -> Vec<u8> {
        let mut tx = LinkCompressor::new(6);
        let mut pending = BufferChain::new();
        pending.append(plain).unwrap();
        let mut out = BufferChain::new();
        tx.compress_chain(&mut pending, &mut out, usize::MAX).unwrap();
        assert!(pending.is_empty());
        let cipher = drain(&mut out);

        let mut rx = LinkDecompressor::new();
        let mut recv = RecvBuffer::new();
        for piece in cipher.chunks(chunk.max(1)) {
            rx.decompress_into(piece, &mut recv).unwrap();
        }
        recv.unconsumed().to_vec()
    }

    #[test]
    fn test_round_trip_small() {
        let plain = b"hello compressed world".to_vec();
        assert_eq!(round_trip(&plain, usize::MAX), plain);
    }

    #[test]
    fn test_round_trip_empty() {
        let mut tx = LinkCompressor::new(6);
        let mut pending = BufferChain::new();
        let mut out = BufferChain::new();
        tx.compress_chain(&mut pending, &mut out, usize::MAX).unwrap();
        assert!(out.is_empty());

        let mut rx = LinkDecompressor::new();
        let mut recv = RecvBuffer::new();
        rx.decompress_into(&[], &mut recv).unwrap();
        assert_eq!(recv.buffered(), 0);
    }

    #[test]
    fn test_round_trip_spans_multiple_nodes() {
        let plain = pseudo_random(3 * NODE_CAPACITY + 777);
        assert_eq!(round_trip(&plain, usize::MAX), plain);
    }

    #[test]
    fn test_round_trip_chunked_decompress() {
        let plain = pseudo_random(10_000);
        assert_eq!(round_trip(&plain, 7), plain);
    }

    #[test]
    fn test_incremental_compress_calls() {
        let mut tx = LinkCompressor::new(6);
        let mut rx = LinkDecompressor::new();
        let mut recv = RecvBuffer::new();
        let mut expected = Vec::new();

        for round in 0..20 {
            let piece = pseudo_random(200 + round * 37);
            expected.extend_from_slice(&piece);

            let mut pending = BufferChain::new();
            pending.append(&piece).unwrap();
            let mut out = BufferChain::new();
            tx.compress_chain(&mut pending, &mut out, usize::MAX).unwrap();
            assert!(pending.is_empty());
            let cipher = drain(&mut out);
            // each call ends in a sync flush, so its output inflates
            // without waiting for future input
            rx.decompress_into(&cipher, &mut recv).unwrap();
        }
        assert_eq!(recv.unconsumed(), &expected[..]);
    }

    #[test]
    fn test_batch_target_bounds_one_pass() {
        let plain = pseudo_random(200 * 1024);
        let mut tx = LinkCompressor::new(6);
        let mut pending = BufferChain::new();
        pending.append(&plain).unwrap();
        let mut out = BufferChain::new();
        tx.compress_chain(&mut pending, &mut out, 16 * 1024).unwrap();
        // random input barely compresses, so the target stops the pass
        // before the pending chain drains
        assert!(out.size() >= 16 * 1024);
        assert!(!pending.is_empty());
    }

    #[test]
    fn test_garbage_ciphertext_is_fatal() {
        let mut rx = LinkDecompressor::new();
        let mut recv = RecvBuffer::new();
        let err = rx.decompress_into(&[0xde, 0xad, 0xbe, 0xef, 0x01], &mut recv);
        assert!(matches!(err, Err(ErrorKind::Decompress(_))));
    }
}
