use std::{collections::TryReserveError, io};

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Errors surfaced by the framing, buffering and queueing layers.
///
/// Every variant is fatal to a single connection only; the process always
/// survives. Would-block conditions are not errors and never appear here:
/// call sites check [`is_transient`] on the raw `io::Error` and defer to
/// the next readiness signal instead.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// A socket read or write failed with something other than would-block.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The peer closed its end of the stream.
    #[error("peer closed the connection")]
    EndOfStream,
    /// A frame header declared a payload larger than the configured cap.
    #[error("declared payload of {length} bytes exceeds the {limit} byte limit")]
    FrameTooLarge {
        /// Payload length announced by the header.
        length: usize,
        /// Configured `max_frame_payload`.
        limit: usize,
    },
    /// A connection's output queue outgrew its class ceiling.
    #[error("output queue reached {queued} bytes, limit is {limit}")]
    QueueOverflow {
        /// Bytes queued at the time of the check.
        queued: usize,
        /// Configured ceiling for the connection's class.
        limit: usize,
    },
    /// The deflate stream on a server link failed.
    #[error("compression failed: {0}")]
    Compress(String),
    /// The inflate stream on a server link failed.
    #[error("decompression failed: {0}")]
    Decompress(String),
    /// A buffer could not grow to hold queued data.
    #[error("buffer allocation failed: {0}")]
    Allocation(#[from] TryReserveError),
    /// The peer violated the protocol in a way that forces closure.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The connection table is full; no further peers are accepted.
    #[error("connection limit reached")]
    AtCapacity,
}

/// Returns true for I/O errors that mean "try again later" rather than
/// "this connection is broken".
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_is_transient() {
        let err = io::Error::new(io::ErrorKind::WouldBlock, "try later");
        assert!(is_transient(&err));
    }

    #[test]
    fn test_reset_is_not_transient() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "gone");
        assert!(!is_transient(&err));
    }
}
