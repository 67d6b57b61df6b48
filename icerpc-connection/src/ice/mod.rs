//! The legacy single-stream framed protocol (spec §4.2, §6.1).

mod codec;
mod connection;

pub use connection::{IceProtocolConnection, PeerShutdownCallback, Role};
