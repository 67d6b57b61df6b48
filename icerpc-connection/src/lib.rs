#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(broken_intra_doc_links)]
#![doc = include_str!("../README.md")]

//! Protocol connections: the two concrete state machines that implement
//! [`icerpc_core::Invoker`]/[`ProtocolConnection`] over a transport (spec
//! §4.2, §4.3).

pub mod connection;
pub mod shutdown;
pub mod transport;

#[cfg(feature = "ice")]
pub mod ice;

#[cfg(feature = "icerpc-protocol")]
pub mod icerpc;

pub use connection::ProtocolConnection;
pub use shutdown::{ConnectionState, ShutdownCoordinator};
pub use transport::{DuplexTransport, MultiplexedStream, MultiplexedTransport};

#[cfg(feature = "ice")]
pub use ice::{IceProtocolConnection, PeerShutdownCallback, Role as IceRole};

#[cfg(feature = "icerpc-protocol")]
pub use icerpc::{IceRpcProtocolConnection, Role as IceRpcRole};
