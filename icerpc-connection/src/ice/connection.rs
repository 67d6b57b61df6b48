//! [`IceProtocolConnection`]: actor-owned state machine for the legacy
//! single-stream framed protocol (spec §4.2).
//!
//! The actor task owns the transport halves and the pending-invocation map
//! outright — exactly the shape of the teacher's `WsServer`/`RequestManager`
//! (`transports/ws.rs`): callers talk to it over an `mpsc` channel, replies
//! are delivered over per-invocation `oneshot` channels, and because only
//! the actor ever touches the map there is no separate mutex to get wrong.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use icerpc_core::{
    error::DispatchErrorCode, CancelToken, Dispatcher, IceRpcError, IncomingRequest,
    IncomingResponse, Invoker, OutgoingRequest, OutgoingResponse, PayloadChunk, PayloadGuard,
    PayloadSource, ResultType,
};
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::connection::ProtocolConnection;
use crate::ice::codec::{
    decode_header, decode_reply, decode_request, encode_frame, encode_reply, encode_request,
    FrameType, ReplyStatus, RequestHeader, HEADER_LEN,
};
use crate::shutdown::{ConnectionState, ShutdownCoordinator};
use crate::transport::DuplexTransport;

/// Which side of the handshake this connection plays (spec §4.2: "Server
/// sends ValidateConnection immediately on accept. Client waits for
/// ValidateConnection before sending any request.").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends `ValidateConnection` immediately and may send/receive at once.
    Server,
    /// Waits for `ValidateConnection` before sending its first request.
    Client,
}

/// Invoked when the peer sends `CloseConnection` (spec §4.7
/// `PeerShutdownInitiated`).
pub type PeerShutdownCallback = Arc<dyn Fn() + Send + Sync>;

struct InvokeRequest {
    path: String,
    operation: String,
    idempotent: bool,
    oneway: bool,
    context: Vec<(String, String)>,
    payload: Bytes,
    respond_to: oneshot::Sender<Result<(ResultType, Bytes), IceRpcError>>,
}

enum ActorCommand {
    Invoke(InvokeRequest),
    SendReplyFrame(Bytes),
}

/// A connection implementing the legacy single-stream framed protocol.
pub struct IceProtocolConnection {
    commands: mpsc::UnboundedSender<ActorCommand>,
    coordinator: ShutdownCoordinator,
    dispatch_cancel_token: CancelToken,
    invocation_cancel_token: CancelToken,
}

impl std::fmt::Debug for IceProtocolConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceProtocolConnection").field("state", &self.coordinator.state()).finish()
    }
}

impl IceProtocolConnection {
    /// Wraps `transport` and spawns its driving actor task. `dispatcher` is
    /// consulted for inbound `Request` frames; pass `None` for a
    /// client-only connection that never dispatches.
    pub fn new<T>(
        transport: T,
        role: Role,
        dispatcher: Option<Arc<dyn Dispatcher>>,
        on_peer_shutdown: Option<PeerShutdownCallback>,
    ) -> Self
    where
        T: DuplexTransport + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let coordinator = ShutdownCoordinator::new();
        let dispatch_cancel_token = CancelToken::new();
        let invocation_cancel_token = CancelToken::new();

        let (read_half, write_half) = split(transport);
        let actor = Actor {
            read_half,
            write_half,
            role,
            validated: role == Role::Server,
            queued: VecDeque::new(),
            pending: BTreeMap::new(),
            next_id: 1,
            poisoned: None,
            dispatcher,
            on_peer_shutdown,
            coordinator: coordinator.clone(),
            dispatch_cancel_token: dispatch_cancel_token.clone(),
            self_commands: commands_tx.clone(),
            commands_rx,
        };
        tokio::spawn(actor.run());

        Self { commands: commands_tx, coordinator, dispatch_cancel_token, invocation_cancel_token }
    }
}

#[async_trait]
impl Invoker for IceProtocolConnection {
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

        let (respond_to, response_rx) = oneshot::channel();
        let command = ActorCommand::Invoke(InvokeRequest {
            path,
            operation,
            idempotent,
            oneway,
            context: Vec::new(),
            payload: body.freeze(),
            respond_to,
        });

        if self.commands.send(command).is_err() {
            guard.set_drop_outcome(Err(Arc::new(IceRpcError::ConnectionClosed)));
            return Err(IceRpcError::ConnectionClosed);
        }

        let outcome = tokio::select! {
            result = response_rx => result.unwrap_or(Err(IceRpcError::ConnectionClosed)),
            _ = cancel.cancelled() => Err(IceRpcError::Cancelled),
            _ = self.invocation_cancel_token.cancelled() => Err(IceRpcError::Cancelled),
        };

        match outcome {
            Ok((result_type, payload)) => {
                guard.finish(Ok(()));
                Ok(IncomingResponse::new(
                    result_type,
                    "1.1",
                    icerpc_core::Fields::new(),
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
impl ProtocolConnection for IceProtocolConnection {
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

struct Actor<T> {
    read_half: ReadHalf<T>,
    write_half: WriteHalf<T>,
    role: Role,
    validated: bool,
    queued: VecDeque<InvokeRequest>,
    pending: BTreeMap<i32, oneshot::Sender<Result<(ResultType, Bytes), IceRpcError>>>,
    next_id: i32,
    poisoned: Option<String>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    on_peer_shutdown: Option<PeerShutdownCallback>,
    coordinator: ShutdownCoordinator,
    dispatch_cancel_token: CancelToken,
    self_commands: mpsc::UnboundedSender<ActorCommand>,
    commands_rx: mpsc::UnboundedReceiver<ActorCommand>,
}

impl<T: DuplexTransport + 'static> Actor<T> {
    async fn run(mut self) {
        if self.role == Role::Server {
            if let Err(e) = self.write_frame(FrameType::ValidateConnection, &[]).await {
                self.poison(e.to_string());
            }
        }

        while self.poisoned.is_none() {
            tokio::select! {
                cmd = self.commands_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                frame = read_frame(&mut self.read_half) => match frame {
                    Ok((frame_type, body)) => {
                        if self.handle_frame(frame_type, body).await {
                            break;
                        }
                    }
                    Err(e) => self.poison(e.to_string()),
                },
            }
        }

        if let Some(reason) = self.poisoned.clone() {
            self.fail_all_pending(reason);
        }
    }

    fn poison(&mut self, reason: String) {
        if self.poisoned.is_none() {
            warn!(reason, "ice connection poisoned");
            self.poisoned = Some(reason);
        }
    }

    fn fail_all_pending(&mut self, reason: String) {
        for (_, respond_to) in std::mem::take(&mut self.pending) {
            let _ = respond_to.send(Err(IceRpcError::TransportFailure(reason.clone().into())));
        }
        for invoke in std::mem::take(&mut self.queued) {
            let _ = invoke
                .respond_to
                .send(Err(IceRpcError::TransportFailure(reason.clone().into())));
        }
    }

    async fn handle_command(&mut self, cmd: ActorCommand) {
        match cmd {
            ActorCommand::Invoke(invoke) => {
                if let Some(reason) = &self.poisoned {
                    let _ = invoke
                        .respond_to
                        .send(Err(IceRpcError::TransportFailure(reason.clone().into())));
                    return;
                }
                if !self.validated {
                    self.queued.push_back(invoke);
                    return;
                }
                self.send_invoke(invoke).await;
            }
            ActorCommand::SendReplyFrame(frame) => {
                if let Err(e) = self.write_half.write_all(&frame).await {
                    self.poison(e.to_string());
                }
            }
        }
    }

    async fn send_invoke(&mut self, invoke: InvokeRequest) {
        let id = if invoke.oneway {
            0
        } else {
            if self.next_id == i32::MAX {
                self.poison("ice request id space exhausted".into());
                let _ = invoke
                    .respond_to
                    .send(Err(IceRpcError::TransportFailure("request id overflow".into())));
                return;
            }
            let id = self.next_id;
            self.next_id += 1;
            id
        };

        let header = RequestHeader {
            request_id: id,
            path: invoke.path,
            operation: invoke.operation,
            idempotent: invoke.idempotent,
            context: invoke.context,
        };
        let body = encode_request(&header, &invoke.payload);

        if let Err(e) = self.write_frame(FrameType::Request, &body).await {
            let _ = invoke.respond_to.send(Err(IceRpcError::transport(e)));
            return;
        }

        if invoke.oneway {
            // Oneway success means "handed to the transport", not "delivered".
            let _ = invoke.respond_to.send(Ok((ResultType::Success, Bytes::new())));
        } else {
            self.pending.insert(id, invoke.respond_to);
        }
    }

    async fn flush_queued(&mut self) {
        let queued = std::mem::take(&mut self.queued);
        for invoke in queued {
            self.send_invoke(invoke).await;
        }
    }

    /// Returns `true` if the actor loop should stop.
    async fn handle_frame(&mut self, frame_type: FrameType, body: Bytes) -> bool {
        match frame_type {
            FrameType::ValidateConnection => {
                if self.role == Role::Client && !self.validated {
                    debug!("ice client received ValidateConnection");
                    self.validated = true;
                    self.flush_queued().await;
                }
                false
            }
            FrameType::Reply => match decode_reply(body) {
                Ok((id, status, payload)) => {
                    if let Some(respond_to) = self.pending.remove(&id) {
                        let result_type = match status {
                            ReplyStatus::Success => ResultType::Success,
                            ReplyStatus::Failure(_) => ResultType::Failure,
                        };
                        let _ = respond_to.send(Ok((result_type, payload)));
                    } else {
                        trace!(id, "reply for unknown request id, dropping");
                    }
                    false
                }
                Err(e) => {
                    self.poison(e.to_string());
                    true
                }
            },
            FrameType::RequestBatch => {
                trace!("dropping unsupported RequestBatch frame");
                false
            }
            FrameType::Request => {
                self.handle_inbound_request(body);
                false
            }
            FrameType::CloseConnection => {
                debug!("peer sent CloseConnection");
                if let Some(cb) = &self.on_peer_shutdown {
                    cb();
                }
                true
            }
        }
    }

    fn handle_inbound_request(&mut self, body: Bytes) {
        let (header, payload) = match decode_request(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "dropping malformed ice request");
                return;
            }
        };

        let Some(dispatcher) = self.dispatcher.clone() else {
            trace!("no dispatcher installed, dropping inbound request");
            return;
        };

        let dispatch_guard = match self.coordinator.begin_dispatch() {
            Ok(guard) => guard,
            Err(_) => {
                trace!("connection shutting down, refusing inbound request");
                return;
            }
        };

        let cancel = self.dispatch_cancel_token.clone();
        let self_commands = self.self_commands.clone();
        let request_id = header.request_id;
        let oneway = request_id == 0;

        tokio::spawn(async move {
            let _dispatch_guard = dispatch_guard;
            let incoming = IncomingRequest::new(
                header.path,
                header.operation,
                header.idempotent,
                icerpc_core::Deadline::Never,
                icerpc_core::Fields::new(),
                Box::new(icerpc_core::payload::BytesPayload::new(payload)),
            );
            let response = dispatcher.dispatch(incoming, cancel).await;
            if oneway {
                return;
            }
            if let Ok(frame) = encode_reply_from_response(request_id, response).await {
                let _ = self_commands.send(ActorCommand::SendReplyFrame(frame));
            }
        });
    }

    async fn write_frame(&mut self, frame_type: FrameType, body: &[u8]) -> std::io::Result<()> {
        let frame = encode_frame(frame_type, body);
        self.write_half.write_all(&frame).await
    }
}

async fn encode_reply_from_response(
    request_id: i32,
    response: OutgoingResponse,
) -> Result<Bytes, IceRpcError> {
    let status = match response.result_type() {
        ResultType::Success => ReplyStatus::Success,
        ResultType::Failure => ReplyStatus::Failure(
            response.error_code().unwrap_or(DispatchErrorCode::UnhandledException),
        ),
    };
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
    Ok(encode_frame(FrameType::Reply, &encode_reply(request_id, status, &body)))
}

fn read_frame<T>(
    read_half: &mut ReadHalf<T>,
) -> impl std::future::Future<Output = Result<(FrameType, Bytes), IceRpcError>> + '_
where
    T: DuplexTransport,
{
    async move {
        let mut header = [0u8; HEADER_LEN];
        read_half.read_exact(&mut header).await.map_err(IceRpcError::transport)?;
        let (frame_type, size) = decode_header(&header)?;
        let mut body = vec![0u8; size as usize];
        if size > 0 {
            read_half.read_exact(&mut body).await.map_err(IceRpcError::transport)?;
        }
        Ok((frame_type, Bytes::from(body)))
    }
}
