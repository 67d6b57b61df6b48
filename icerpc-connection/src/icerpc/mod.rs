//! The modern multiplexed stream-per-request protocol (spec §4.3, §6.2).

mod codec;
mod connection;

pub use connection::{IceRpcProtocolConnection, Role};
