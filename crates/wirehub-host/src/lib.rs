#![warn(missing_docs)]

//! wirehub-host: the reactor, dispatch table and built-in handlers.

/// Sorted dispatch table mapping message tags to handlers.
pub mod dispatch;
/// Built-in protocol handlers.
pub mod handlers;
/// The single-threaded reactor event loop.
pub mod reactor;
/// Global throughput accounting.
pub mod stats;
/// Cooperative periodic timers.
pub mod timer;

pub use dispatch::{DispatchTable, Handler};
pub use reactor::{ConnId, Reactor};
pub use stats::GlobalStats;
