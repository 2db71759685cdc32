#![warn(missing_docs)]

//! wirehub-session: per-connection state machine and queueing.

mod connection;

pub use connection::{Connection, ConnectionClass};
