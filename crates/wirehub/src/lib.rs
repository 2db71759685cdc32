#![warn(missing_docs)]

//! Wirehub: a small public API facade for the workspace.
//!
//! This crate re-exports the surface needed to run a directory/chat
//! server speaking the binary tag-length-value protocol:
//!
//! - The reactor and connection ids (`Reactor`, `ConnId`)
//! - Frame encoding (`encode_frame`) and message tags (`tags`)
//! - Core configuration (`Config`) and errors (`ErrorKind`, `Result`)
//!
//! Example
//! ```no_run
//! use wirehub::{Config, Reactor};
//!
//! let mut reactor = Reactor::new(Config::default()).unwrap();
//! reactor.listen("0.0.0.0:8888".parse().unwrap()).unwrap();
//! reactor.run().unwrap();
//! ```

// Core config and errors
pub use wirehub_core::{config::Config, error::{ErrorKind, Result}, tags};
// Host: reactor, dispatch table and handler registration
pub use wirehub_host::{ConnId, DispatchTable, Handler, Reactor};
// Protocol: frame encoding for handler replies and tests
pub use wirehub_protocol::frame::{encode_frame, encode_frame_into, Header};
// Session: connection classes, visible through the reactor's accessors
pub use wirehub_session::ConnectionClass;

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{tags, Config, ConnId, ConnectionClass, ErrorKind, Handler, Reactor, Result};
}
