#![warn(missing_docs)]

//! wirehub-core: foundational types shared across all layers.
//!
//! This crate provides the minimal set of core utilities the other
//! workspace members build on:
//! - Configuration types
//! - Error handling
//! - Protocol constants and message tags
//!
//! Protocol-specific logic lives in specialized crates:
//! - `wirehub-protocol`: frame codec, buffer chains, stream compression
//! - `wirehub-session`: per-connection state and queueing
//! - `wirehub-host`: reactor, dispatch table, built-in handlers

/// Server configuration.
pub mod config;
/// Error taxonomy and result alias.
pub mod error;
/// Message tag constants and the registration allow-list.
pub mod tags;

/// Protocol constants shared across layers.
pub mod constants {
    /// The size of the frame header: a little-endian payload length
    /// followed by a little-endian message tag, two bytes each.
    pub const HEADER_SIZE: usize = 4;
    /// Capacity of a single output buffer node.
    pub const NODE_CAPACITY: usize = 4096;
    /// Size of the per-read scratch chunk used on compressed links.
    pub const READ_CHUNK: usize = 2048;
    /// Increment by which the receive buffer grows while decompressing.
    pub const RECV_GROW: usize = 2048;
}

pub use config::Config;
pub use error::{ErrorKind, Result};
