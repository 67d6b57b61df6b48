//! The common surface both [`crate::ice::IceProtocolConnection`] and
//! [`crate::icerpc::IceRpcProtocolConnection`] implement.

use async_trait::async_trait;
use auto_impl::auto_impl;
use icerpc_core::{CancelToken, Invoker};

use crate::shutdown::ConnectionState;

/// A connected transport capable of invoking requests and draining on
/// shutdown (spec §2's "data flow" summary). The invoke operation itself is
/// [`Invoker::invoke`]; a connection is the terminal invoker any interceptor
/// pipeline eventually calls into.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait ProtocolConnection: Invoker {
    /// The connection's current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// `true` while one or more dispatches are in flight.
    fn has_dispatches_in_progress(&self) -> bool;

    /// `true` while one or more invocations are in flight.
    fn has_invocations_in_progress(&self) -> bool;

    /// Transitions to `ShuttingDown`, drains in-flight work, then `Closed`
    /// (spec §4.7). See [`crate::shutdown::ShutdownCoordinator::shutdown`].
    async fn shutdown(&self, cancel: CancelToken);

    /// Hard abort: fails in-flight work immediately and closes the
    /// transport (spec §4.7 Dispose).
    fn dispose(&self);
}
