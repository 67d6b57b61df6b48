//! Transport bounds the protocol connections are generic over. Dialing,
//! accepting, and TLS are out of scope (spec §1) — callers hand over an
//! already-connected transport.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use icerpc_core::IceRpcError;

/// A single ordered, reliable byte stream — what `ice` framing requires.
pub trait DuplexTransport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexTransport for T {}

/// One bidirectional stream inside a multiplexed transport: one per `icerpc`
/// request (spec §4.3).
pub trait MultiplexedStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> MultiplexedStream for T {}

/// A Slic-like multiplexed transport (spec §4.3): accept-stream,
/// open-bidirectional-stream, open-unidirectional-stream. Oneway requests use
/// a unidirectional stream; twoway requests use a bidirectional one.
#[async_trait]
pub trait MultiplexedTransport: Send {
    /// The concrete stream type this transport hands out.
    type Stream: MultiplexedStream + 'static;

    /// Opens a new bidirectional stream for a twoway request.
    async fn open_bidirectional_stream(&mut self) -> Result<Self::Stream, IceRpcError>;

    /// Opens a new unidirectional (write-only) stream for a oneway request.
    async fn open_unidirectional_stream(&mut self) -> Result<Self::Stream, IceRpcError>;

    /// Accepts the next incoming stream, blocking until one arrives.
    async fn accept_stream(&mut self) -> Result<Self::Stream, IceRpcError>;
}
