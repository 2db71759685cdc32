#![warn(missing_docs)]

//! wirehub-protocol: wire framing, buffer chains and stream compression.

/// Chained fixed-capacity output buffers.
pub mod buffer;
/// Streaming zlib contexts for peer-server links.
pub mod compress;
/// Frame header encoding and decoding.
pub mod frame;
/// Contiguous, compacting receive buffer and frame scanning.
pub mod recv;

pub use buffer::{BufferChain, BufferNode};
pub use compress::{LinkCompressor, LinkDecompressor};
pub use frame::{encode_frame, encode_frame_into, Header};
pub use recv::{FrameStatus, RecvBuffer};
