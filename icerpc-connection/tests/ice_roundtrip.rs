//! Cross-module scenario: a full `ice` handshake and request/response round
//! trip over an in-memory duplex pair, the way `ethers-connections/tests`
//! exercises a `Provider` against a real transport rather than a mock.

#![cfg(feature = "ice")]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use icerpc_core::payload::BytesPayload;
use icerpc_core::{
    CancelToken, Dispatcher, FieldKey, IncomingRequest, Invoker, OutgoingRequest, OutgoingResponse,
    ProtocolTag, Proxy, ResultType,
};
use icerpc_connection::{IceProtocolConnection, IceRole, ProtocolConnection};
use tokio::sync::Notify;

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
        OutgoingResponse::success("1.1", Box::new(BytesPayload::new(body)))
    }
}

#[tracing_test::traced_test]
#[tokio::test]
async fn request_echoes_through_a_full_handshake() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let client = IceProtocolConnection::new(client_io, IceRole::Client, None, None);
    let server =
        IceProtocolConnection::new(server_io, IceRole::Server, Some(Arc::new(EchoDispatcher)), None);

    let proxy = Proxy::new(ProtocolTag::Ice, "/greeter").unwrap();
    let request =
        OutgoingRequest::new(proxy, "sayHello", Box::new(BytesPayload::new(&b"hello"[..]))).unwrap();

    let response = client.invoke(request, CancelToken::new()).await.unwrap();
    assert_eq!(response.result_type(), ResultType::Success);

    let mut response = response;
    let mut body = Vec::new();
    loop {
        use icerpc_core::payload::PayloadChunk;
        match response.payload_mut().read().await.unwrap() {
            PayloadChunk::Data(bytes) => body.extend_from_slice(&bytes),
            PayloadChunk::Eof => break,
        }
    }
    assert_eq!(body, b"hello");
    assert!(logs_contain("ice client received ValidateConnection"));

    drop(server);
}

#[tokio::test]
async fn oneway_request_gets_an_empty_success_without_waiting_for_a_reply() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let client = IceProtocolConnection::new(client_io, IceRole::Client, None, None);
    let _server =
        IceProtocolConnection::new(server_io, IceRole::Server, Some(Arc::new(EchoDispatcher)), None);

    let proxy = Proxy::new(ProtocolTag::Ice, "/greeter").unwrap();
    let request = OutgoingRequest::new(proxy, "fireAndForget", Box::new(BytesPayload::empty()))
        .unwrap()
        .with_oneway(true);

    let response = client.invoke(request, CancelToken::new()).await.unwrap();
    assert_eq!(response.result_type(), ResultType::Success);
}

struct HangingDispatcher;

#[async_trait]
impl Dispatcher for HangingDispatcher {
    async fn dispatch(&self, _request: IncomingRequest, cancel: CancelToken) -> OutgoingResponse {
        cancel.cancelled().await;
        OutgoingResponse::success("1.1", Box::new(BytesPayload::empty()))
    }
}

#[tokio::test]
async fn a_field_whose_encoder_fails_reports_invalid_argument_and_completes_the_payload() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let client = IceProtocolConnection::new(client_io, IceRole::Client, None, None);
    let _server =
        IceProtocolConnection::new(server_io, IceRole::Server, Some(Arc::new(EchoDispatcher)), None);

    let payload = BytesPayload::new(&b"hello"[..]);
    let completion = {
        use icerpc_core::PayloadSource;
        payload.completion()
    };

    let proxy = Proxy::new(ProtocolTag::Ice, "/greeter").unwrap();
    let request = OutgoingRequest::new(proxy, "sayHello", Box::new(payload))
        .unwrap()
        .with_field_encoder(FieldKey(10), || {
            Err(icerpc_core::IceRpcError::InvalidData("invalid request fields".into()))
        });

    let err = client.invoke(request, CancelToken::new()).await.unwrap_err();
    assert!(matches!(err, icerpc_core::IceRpcError::InvalidArgument(_)));

    let outcome = completion.wait().await;
    assert!(matches!(outcome, Err(e) if matches!(*e, icerpc_core::IceRpcError::InvalidArgument(_))));
}

#[tokio::test]
async fn invoking_after_shutdown_fails_the_payload_with_connection_closed() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let client = IceProtocolConnection::new(client_io, IceRole::Client, None, None);
    let _server =
        IceProtocolConnection::new(server_io, IceRole::Server, Some(Arc::new(EchoDispatcher)), None);

    client.shutdown(CancelToken::new()).await;

    let payload = BytesPayload::new(&b"hello"[..]);
    let completion = {
        use icerpc_core::PayloadSource;
        payload.completion()
    };

    let proxy = Proxy::new(ProtocolTag::Ice, "/greeter").unwrap();
    let request = OutgoingRequest::new(proxy, "sayHello", Box::new(payload)).unwrap();

    let err = client.invoke(request, CancelToken::new()).await.unwrap_err();
    assert!(err.is_closed());

    let outcome = completion.wait().await;
    assert!(matches!(outcome, Err(e) if e.is_closed()));
}

#[tokio::test]
async fn shutdown_with_cancel_fails_pending_invocations_with_cancelled_and_still_completes() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let client = Arc::new(IceProtocolConnection::new(client_io, IceRole::Client, None, None));
    let _server = IceProtocolConnection::new(
        server_io,
        IceRole::Server,
        Some(Arc::new(HangingDispatcher)),
        None,
    );

    let proxy = Proxy::new(ProtocolTag::Ice, "/greeter").unwrap();
    let request =
        OutgoingRequest::new(proxy, "neverReturns", Box::new(BytesPayload::empty())).unwrap();

    let started = Arc::new(Notify::new());
    let invoke_task = tokio::spawn({
        let client = client.clone();
        let started = started.clone();
        async move {
            started.notify_one();
            client.invoke(request, CancelToken::new()).await
        }
    });

    started.notified().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.shutdown(CancelToken::already_cancelled()).await;

    let result = tokio::time::timeout(Duration::from_secs(1), invoke_task)
        .await
        .expect("shutdown-with-cancel must not hang the pending invocation")
        .unwrap();
    assert!(result.unwrap_err().is_cancelled());
}
