//! Cross-module scenario: a full `icerpc` Initialize/peer-fields exchange
//! and request/response round trip over an in-memory multiplexed transport,
//! built the same way `ice_roundtrip.rs` drives `ice` over a duplex pair.

#![cfg(feature = "icerpc-protocol")]

use std::sync::Arc;

use async_trait::async_trait;
use icerpc_core::payload::BytesPayload;
use icerpc_core::{
    CancelToken, Dispatcher, FieldKey, Fields, IncomingRequest, Invoker, OutgoingRequest,
    OutgoingResponse, ProtocolTag, Proxy, ResultType,
};
use icerpc_connection::transport::MultiplexedTransport;
use icerpc_connection::{IceRpcProtocolConnection, IceRpcRole};
use icerpc_router::{DefaultDispatcher, Router};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

/// An in-memory multiplexed transport: every `open_*_stream` call hands the
/// caller one half of a fresh `tokio::io::duplex` pair and posts the other
/// half to the peer's `accept_stream` queue.
struct ChannelTransport {
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
    outgoing: mpsc::UnboundedSender<DuplexStream>,
}

impl ChannelTransport {
    fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self { incoming: rx_a, outgoing: tx_b }, Self { incoming: rx_b, outgoing: tx_a })
    }
}

#[async_trait]
impl MultiplexedTransport for ChannelTransport {
    type Stream = DuplexStream;

    async fn open_bidirectional_stream(&mut self) -> Result<Self::Stream, icerpc_core::IceRpcError> {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        self.outgoing.send(remote).map_err(|_| icerpc_core::IceRpcError::ConnectionClosed)?;
        Ok(local)
    }

    async fn open_unidirectional_stream(
        &mut self,
    ) -> Result<Self::Stream, icerpc_core::IceRpcError> {
        self.open_bidirectional_stream().await
    }

    async fn accept_stream(&mut self) -> Result<Self::Stream, icerpc_core::IceRpcError> {
        self.incoming.recv().await.ok_or(icerpc_core::IceRpcError::ConnectionClosed)
    }
}

struct EchoDispatcher;

#[async_trait]
impl Dispatcher for EchoDispatcher {
    async fn dispatch(&self, mut request: IncomingRequest, _cancel: CancelToken) -> OutgoingResponse {
        use icerpc_core::{payload::PayloadChunk, PayloadSource};

        let mut body = Vec::new();
        loop {
            match request.payload_mut().read().await {
                Ok(PayloadChunk::Data(bytes)) => body.extend_from_slice(&bytes),
                Ok(PayloadChunk::Eof) => break,
                Err(_) => break,
            }
        }
        request.payload_mut().complete(Ok(()));
        OutgoingResponse::success("slice2", Box::new(BytesPayload::new(body)))
    }
}

fn local_fields(max_header_size: i32) -> Fields {
    let mut fields = Fields::new();
    fields.insert(FieldKey::MAX_HEADER_SIZE, bytes::Bytes::copy_from_slice(&max_header_size.to_le_bytes()));
    fields
}

#[tokio::test]
async fn request_echoes_through_initialize_and_peer_fields_are_observable() {
    let (client_transport, server_transport) = ChannelTransport::pair();

    let client_fields = local_fields(16 * 1024);
    let server_fields = local_fields(32 * 1024);

    let (client, server) = tokio::join!(
        IceRpcProtocolConnection::new(client_transport, IceRpcRole::Client, client_fields, None),
        IceRpcProtocolConnection::new(
            server_transport,
            IceRpcRole::Server,
            server_fields,
            Some(Arc::new(EchoDispatcher) as Arc<dyn Dispatcher>),
        ),
    );
    let client = client.unwrap();
    let _server = server.unwrap();

    // Scenario 6: each side's peer_fields() reflects what the other side
    // advertised during Initialize, not its own.
    assert_eq!(
        client.peer_fields().get(&FieldKey::MAX_HEADER_SIZE).unwrap().as_ref(),
        &(32i32 * 1024).to_le_bytes()
    );

    let proxy = Proxy::new(ProtocolTag::IceRpc, "/greeter").unwrap();
    let request =
        OutgoingRequest::new(proxy, "sayHello", Box::new(BytesPayload::new(&b"hello"[..]))).unwrap();

    let mut response = client.invoke(request, CancelToken::new()).await.unwrap();
    assert_eq!(response.result_type(), ResultType::Success);

    let mut body = Vec::new();
    loop {
        use icerpc_core::payload::PayloadChunk;
        use icerpc_core::PayloadSource;
        match response.payload_mut().read().await.unwrap() {
            PayloadChunk::Data(bytes) => body.extend_from_slice(&bytes),
            PayloadChunk::Eof => break,
        }
    }
    assert_eq!(body, b"hello");
}

#[tokio::test]
async fn a_router_failure_is_observed_as_the_dispatcher_s_actual_error_code() {
    let (client_transport, server_transport) = ChannelTransport::pair();

    let mut router = Router::new();
    router.map("/greeter", Arc::new(DefaultDispatcher)).unwrap();

    let (client, server) = tokio::join!(
        IceRpcProtocolConnection::new(
            client_transport,
            IceRpcRole::Client,
            Fields::new(),
            None,
        ),
        IceRpcProtocolConnection::new(
            server_transport,
            IceRpcRole::Server,
            Fields::new(),
            Some(Arc::new(router) as Arc<dyn Dispatcher>),
        ),
    );
    let client = client.unwrap();
    let _server = server.unwrap();

    // Scenario 8: an unmatched path dispatches to `DefaultDispatcher`, which
    // fails with `ServiceNotFound`; the router encodes that code as the
    // payload's first byte (spec §8 scenario 8's "DispatchException
    // mapping").
    let proxy = Proxy::new(ProtocolTag::IceRpc, "/nonexistent").unwrap();
    let request =
        OutgoingRequest::new(proxy, "sayHello", Box::new(BytesPayload::empty())).unwrap();

    let mut response = client.invoke(request, CancelToken::new()).await.unwrap();
    assert_eq!(response.result_type(), ResultType::Failure);

    use icerpc_core::payload::PayloadChunk;
    use icerpc_core::PayloadSource;
    let first_chunk = loop {
        match response.payload_mut().read().await.unwrap() {
            PayloadChunk::Data(bytes) if !bytes.is_empty() => break bytes,
            PayloadChunk::Data(_) => continue,
            PayloadChunk::Eof => panic!("expected a failure code byte"),
        }
    };
    assert_eq!(first_chunk[0], 0, "0 is the router's ServiceNotFound tag");
}
