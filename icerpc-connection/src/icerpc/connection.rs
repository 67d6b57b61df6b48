//! [`IceRpcProtocolConnection`]: actor-brokered stream-per-request protocol
//! (spec §4.3).
//!
//! Opening a stream requires exclusive access to the transport, so that part
//! is serialized through an actor exactly like [`crate::ice::IceProtocolConnection`]
//! does for writes. Once a stream is handed back to a caller, though, it is
//! an independent `AsyncRead + AsyncWrite` object — request and response I/O
//! on it proceeds without going back through the actor.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use icerpc_core::{
    CancelToken, Dispatcher, Fields, IceRpcError, IncomingRequest, IncomingResponse, Invoker,
    OutgoingRequest, OutgoingResponse, PayloadChunk, PayloadGuard, PayloadSource, ResultType,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::connection::ProtocolConnection;
use crate::icerpc::codec::{
    decode_initialize, decode_request_header, decode_response_header, encode_frame,
    encode_initialize, encode_request_header, encode_response_header, FrameType, RequestHeader,
    ResponseHeader, WireResultType,
};
use crate::shutdown::{ConnectionState, ShutdownCoordinator};
use crate::transport::MultiplexedTransport;
use icerpc_core::varint::write_varuint;

/// Which side opens the connection's first stream during Initialize (spec
/// §4.3 step 1-2): the client opens it, the server accepts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

enum TransportCommand<S> {
    OpenBidirectional(oneshot::Sender<Result<S, IceRpcError>>),
    OpenUnidirectional(oneshot::Sender<Result<S, IceRpcError>>),
}

/// A connection implementing the multiplexed stream-per-request protocol.
pub struct IceRpcProtocolConnection<T: MultiplexedTransport> {
    commands: mpsc::UnboundedSender<TransportCommand<T::Stream>>,
    coordinator: ShutdownCoordinator,
    dispatch_cancel_token: CancelToken,
    invocation_cancel_token: CancelToken,
    peer_fields: Arc<Fields>,
}

impl<T: MultiplexedTransport> std::fmt::Debug for IceRpcProtocolConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceRpcProtocolConnection").field("state", &self.coordinator.state()).finish()
    }
}

impl<T> IceRpcProtocolConnection<T>
where
    T: MultiplexedTransport + 'static,
{
    /// Performs the Initialize/InitializeAck fields exchange on the
    /// connection's first stream, then spawns the actor driving every later
    /// stream open and inbound dispatch.
    pub async fn new(
        mut transport: T,
        role: Role,
        local_fields: Fields,
        dispatcher: Option<Arc<dyn Dispatcher>>,
    ) -> Result<Self, IceRpcError> {
        let peer_fields = match role {
            Role::Client => {
                let mut stream = transport.open_bidirectional_stream().await?;
                write_message(&mut stream, FrameType::Initialize, &encode_initialize(&local_fields), &[])
                    .await?;
                let (frame_type, header, _payload) = read_message(&mut stream).await?;
                if frame_type != FrameType::InitializeAck {
                    return Err(IceRpcError::ProtocolFailure(
                        "expected InitializeAck from peer".into(),
                    ));
                }
                decode_initialize(header)?
            }
            Role::Server => {
                let mut stream = transport.accept_stream().await?;
                let (frame_type, header, _payload) = read_message(&mut stream).await?;
                if frame_type != FrameType::Initialize {
                    return Err(IceRpcError::ProtocolFailure("expected Initialize from peer".into()));
                }
                let peer_fields = decode_initialize(header)?;
                write_message(
                    &mut stream,
                    FrameType::InitializeAck,
                    &encode_initialize(&local_fields),
                    &[],
                )
                .await?;
                peer_fields
            }
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let coordinator = ShutdownCoordinator::new();
        let dispatch_cancel_token = CancelToken::new();
        let invocation_cancel_token = CancelToken::new();

        let actor = Actor {
            transport,
            dispatcher,
            coordinator: coordinator.clone(),
            dispatch_cancel_token: dispatch_cancel_token.clone(),
            commands_rx,
        };
        tokio::spawn(actor.run());

        Ok(Self {
            commands: commands_tx,
            coordinator,
            dispatch_cancel_token,
            invocation_cancel_token,
            peer_fields: Arc::new(peer_fields),
        })
    }

    /// The fields the peer advertised during Initialize (spec §4.3 step 2),
    /// e.g. its `MAX_HEADER_SIZE`.
    pub fn peer_fields(&self) -> &Fields {
        &self.peer_fields
    }

    async fn open_stream(&self, oneway: bool) -> Result<T::Stream, IceRpcError> {
        let (respond_to, rx) = oneshot::channel();
        let command = if oneway {
            TransportCommand::OpenUnidirectional(respond_to)
        } else {
            TransportCommand::OpenBidirectional(respond_to)
        };
        self.commands.send(command).map_err(|_| IceRpcError::ConnectionClosed)?;
        rx.await.map_err(|_| IceRpcError::ConnectionClosed)?
    }
}

#[async_trait]
impl<T> Invoker for IceRpcProtocolConnection<T>
where
    T: MultiplexedTransport + 'static,
{
    async fn invoke(
        &self,
        mut request: OutgoingRequest,
        cancel: CancelToken,
    ) -> Result<IncomingResponse, IceRpcError> {
        if let Err(e) = request.encode_fields() {
            let guard =
                PayloadGuard::new(request.into_payload(), Err(Arc::new(IceRpcError::Cancelled)));
            guard.finish(Err(Arc::new(e.dup())));
            return Err(e);
        }

        let path = request.path().to_string();
        let operation = request.operation().to_string();
        let idempotent = request.is_idempotent();
        let oneway = request.is_oneway();
        let deadline_millis = request.deadline().to_millis();
        let fields = request.fields().clone();

        let mut guard =
            PayloadGuard::new(request.into_payload(), Err(Arc::new(IceRpcError::Cancelled)));

        let _invocation_guard = match self.coordinator.begin_invocation() {
            Ok(guard) => guard,
            Err(e) => {
                guard.finish(Err(Arc::new(IceRpcError::ConnectionClosed)));
                return Err(e);
            }
        };

        let mut body = BytesMut::new();
        loop {
            match guard.get_mut().read().await {
                Ok(PayloadChunk::Data(bytes)) => body.extend_from_slice(&bytes),
                Ok(PayloadChunk::Eof) => break,
                Err(e) => {
                    guard.finish(Err(Arc::new(IceRpcError::InvalidArgument(e.to_string()))));
                    return Err(IceRpcError::InvalidArgument(e.to_string()));
                }
            }
        }

        let io = async {
            let mut stream = self.open_stream(oneway).await?;
            let header =
                RequestHeader { path, operation, idempotent, oneway, deadline_millis, fields };
            write_message(&mut stream, FrameType::Request, &encode_request_header(&header), &body)
                .await?;

            if oneway {
                return Ok((ResultType::Success, "slice2".to_string(), Fields::new(), Bytes::new()));
            }

            let (frame_type, header, payload) = read_message(&mut stream).await?;
            if frame_type != FrameType::Response {
                return Err(IceRpcError::ProtocolFailure("expected Response frame".into()));
            }
            let response_header = decode_response_header(header)?;
            let result_type = match response_header.result_type {
                WireResultType::Success => ResultType::Success,
                WireResultType::Failure => ResultType::Failure,
            };
            Ok((result_type, response_header.payload_encoding, response_header.fields, payload))
        };

        let outcome = tokio::select! {
            result = io => result,
            _ = cancel.cancelled() => Err(IceRpcError::Cancelled),
            _ = self.invocation_cancel_token.cancelled() => Err(IceRpcError::Cancelled),
        };

        match outcome {
            Ok((result_type, payload_encoding, fields, payload)) => {
                guard.finish(Ok(()));
                Ok(IncomingResponse::new(
                    result_type,
                    payload_encoding,
                    fields,
                    Box::new(icerpc_core::payload::BytesPayload::new(payload)),
                ))
            }
            Err(e) => {
                guard.set_drop_outcome(Err(Arc::new(e.dup())));
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<T> ProtocolConnection for IceRpcProtocolConnection<T>
where
    T: MultiplexedTransport + 'static,
{
    fn state(&self) -> ConnectionState {
        self.coordinator.state()
    }

    fn has_dispatches_in_progress(&self) -> bool {
        self.coordinator.has_dispatches_in_progress()
    }

    fn has_invocations_in_progress(&self) -> bool {
        self.coordinator.has_invocations_in_progress()
    }

    async fn shutdown(&self, cancel: CancelToken) {
        self.coordinator
            .shutdown(&self.dispatch_cancel_token, &self.invocation_cancel_token, cancel)
            .await;
    }

    fn dispose(&self) {
        self.coordinator.dispose();
    }
}

struct Actor<T: MultiplexedTransport> {
    transport: T,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    coordinator: ShutdownCoordinator,
    dispatch_cancel_token: CancelToken,
    commands_rx: mpsc::UnboundedReceiver<TransportCommand<T::Stream>>,
}

impl<T> Actor<T>
where
    T: MultiplexedTransport + 'static,
{
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands_rx.recv() => match cmd {
                    Some(TransportCommand::OpenBidirectional(respond_to)) => {
                        let result = self.transport.open_bidirectional_stream().await;
                        let _ = respond_to.send(result);
                    }
                    Some(TransportCommand::OpenUnidirectional(respond_to)) => {
                        let result = self.transport.open_unidirectional_stream().await;
                        let _ = respond_to.send(result);
                    }
                    None => break,
                },
                stream = self.transport.accept_stream() => match stream {
                    Ok(stream) => self.handle_inbound_stream(stream),
                    Err(e) => {
                        warn!(error = %e, "icerpc transport accept failed, stopping actor");
                        break;
                    }
                },
            }
        }
    }

    fn handle_inbound_stream(&mut self, mut stream: T::Stream) {
        let Some(dispatcher) = self.dispatcher.clone() else {
            trace!("no dispatcher installed, dropping inbound stream");
            return;
        };

        let dispatch_guard = match self.coordinator.begin_dispatch() {
            Ok(guard) => guard,
            Err(_) => {
                trace!("connection shutting down, refusing inbound stream");
                return;
            }
        };

        let cancel = self.dispatch_cancel_token.clone();

        tokio::spawn(async move {
            let _dispatch_guard = dispatch_guard;
            let (frame_type, header, payload) = match read_message(&mut stream).await {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "dropping malformed icerpc inbound stream");
                    return;
                }
            };
            if frame_type != FrameType::Request {
                warn!("expected Request frame on inbound stream");
                return;
            }
            let header = match decode_request_header(header) {
                Ok(header) => header,
                Err(e) => {
                    warn!(error = %e, "dropping malformed icerpc request header");
                    return;
                }
            };
            let oneway = header.oneway;
            let deadline = icerpc_core::Deadline::from_millis(header.deadline_millis);
            let incoming = IncomingRequest::new(
                header.path,
                header.operation,
                header.idempotent,
                deadline,
                header.fields,
                Box::new(icerpc_core::payload::BytesPayload::new(payload)),
            );
            let response = dispatcher.dispatch(incoming, cancel).await;
            if oneway {
                return;
            }
            if let Err(e) = write_response(&mut stream, response).await {
                warn!(error = %e, "failed writing icerpc response");
            }
        });
    }
}

async fn write_response<S>(stream: &mut S, response: OutgoingResponse) -> Result<(), IceRpcError>
where
    S: AsyncWrite + Unpin,
{
    let result_type = match response.result_type() {
        ResultType::Success => WireResultType::Success,
        ResultType::Failure => WireResultType::Failure,
    };
    let payload_encoding = response.payload_encoding().to_string();
    let fields = response.fields().clone();
    let mut payload = response.into_payload();
    let mut body = BytesMut::new();
    loop {
        match payload.read().await {
            Ok(PayloadChunk::Data(bytes)) => body.extend_from_slice(&bytes),
            Ok(PayloadChunk::Eof) => break,
            Err(e) => {
                payload.complete(Err(Arc::new(e.dup())));
                return Err(e);
            }
        }
    }
    payload.complete(Ok(()));
    let header = ResponseHeader { result_type, payload_encoding, fields };
    write_message(stream, FrameType::Response, &encode_response_header(&header), &body).await
}

async fn write_message<S>(
    stream: &mut S,
    frame_type: FrameType,
    header: &[u8],
    payload: &[u8],
) -> Result<(), IceRpcError>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&encode_frame(frame_type, header));
    write_varuint(&mut buf, payload.len() as u64);
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await.map_err(IceRpcError::transport)
}

async fn read_message<S>(stream: &mut S) -> Result<(FrameType, Bytes, Bytes), IceRpcError>
where
    S: AsyncRead + Unpin,
{
    let mut type_byte = [0u8; 1];
    stream.read_exact(&mut type_byte).await.map_err(IceRpcError::transport)?;
    let frame_type = FrameType::from_byte(type_byte[0])?;
    let header_len = read_async_varuint(stream).await? as usize;
    let header = read_exact_bytes(stream, header_len).await?;
    let payload_len = read_async_varuint(stream).await? as usize;
    let payload = read_exact_bytes(stream, payload_len).await?;
    debug!(?frame_type, header_len, payload_len, "read icerpc message");
    Ok((frame_type, header, payload))
}

async fn read_exact_bytes<S>(stream: &mut S, len: usize) -> Result<Bytes, IceRpcError>
where
    S: AsyncRead + Unpin,
{
    if len == 0 {
        return Ok(Bytes::new());
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map_err(IceRpcError::transport)?;
    Ok(Bytes::from(buf))
}

async fn read_async_varuint<S>(stream: &mut S) -> Result<u64, IceRpcError>
where
    S: AsyncRead + Unpin,
{
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        if shift >= 64 {
            return Err(IceRpcError::ProtocolFailure("varuint overflow".into()));
        }
        let byte = stream.read_u8().await.map_err(IceRpcError::transport)?;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}
