//! The two callable shapes the rest of the runtime is built from (spec
//! GLOSSARY): a [`Dispatcher`] turns an [`IncomingRequest`] into an
//! [`OutgoingResponse`] on the server side; an [`Invoker`] turns an
//! [`OutgoingRequest`] into an [`IncomingResponse`] on the client side.
//!
//! Both live here, rather than in `icerpc-connection` or `icerpc-router`, so
//! that a protocol connection can drive a router-supplied dispatcher and a
//! router-supplied pipeline can terminate at a connection-supplied invoker
//! without either crate depending on the other.

use async_trait::async_trait;
use auto_impl::auto_impl;

use crate::cancel::CancelToken;
use crate::error::IceRpcError;
use crate::frame::{IncomingRequest, IncomingResponse, OutgoingRequest, OutgoingResponse};

/// Server-side callable: `IncomingRequest -> OutgoingResponse` (spec §4.4,
/// §4.3 AcceptRequests step 2).
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait Dispatcher: Send + Sync {
    /// Handles one request. `cancel` fires if the connection's shutdown
    /// coordinator cancels in-flight dispatches, or the request's stream is
    /// reset by the peer.
    async fn dispatch(&self, request: IncomingRequest, cancel: CancelToken) -> OutgoingResponse;
}

/// Client-side callable: `OutgoingRequest -> IncomingResponse` (spec §4.5).
/// Implemented by both protocol connections and by interceptors that wrap an
/// inner invoker.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait Invoker: Send + Sync {
    /// Sends `request`, returning the peer's response (or a synthetic empty
    /// one for oneway requests).
    async fn invoke(
        &self,
        request: OutgoingRequest,
        cancel: CancelToken,
    ) -> Result<IncomingResponse, IceRpcError>;
}
