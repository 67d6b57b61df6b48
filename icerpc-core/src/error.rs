//! Shared error taxonomy (spec §7).
//!
//! [`IceRpcError`] is the single error kind carried by payload completions,
//! invocation failures, and dispatch outcomes. It deliberately does not leak
//! raw transport exceptions: every connection-level failure is mapped into
//! one of these variants before it reaches user code.

use std::fmt;

use thiserror::Error;

/// Error codes surfaced to peers in a `icerpc` Failure response (spec §6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DispatchErrorCode {
    /// No dispatcher matched the request path.
    ServiceNotFound,
    /// The dispatcher matched but has no such operation.
    OperationNotFound,
    /// The request body or header was malformed.
    InvalidData,
    /// The handler raised an exception the core doesn't otherwise classify.
    UnhandledException,
    /// The dispatch was cancelled before the handler returned.
    Canceled,
}

impl fmt::Display for DispatchErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ServiceNotFound => "service not found",
            Self::OperationNotFound => "operation not found",
            Self::InvalidData => "invalid data",
            Self::UnhandledException => "unhandled exception",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// The error kind taxonomy carried by payload completions, failed
/// invocations, and dispatch exceptions (spec §7).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IceRpcError {
    /// Underlying I/O or framing broke. The connection transitions to
    /// `Closed`.
    #[error("transport failure: {0}")]
    TransportFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A decoded header violated the protocol.
    #[error("protocol failure: {0}")]
    ProtocolFailure(String),

    /// Peer or local shutdown raced the operation.
    #[error("connection closed")]
    ConnectionClosed,

    /// The handler raised an exception; mapped to a [`DispatchErrorCode`] and
    /// encoded as a Failure response rather than closing the connection.
    #[error("dispatch failure ({code}): {message}")]
    DispatchFailure {
        /// The error code surfaced to the peer.
        code: DispatchErrorCode,
        /// A human-readable message, not part of the wire contract.
        message: String,
    },

    /// A malformed body or a class graph too deep to decode safely.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Caller cancellation, a deadline, or a shutdown cancel token fired.
    #[error("operation canceled")]
    Cancelled,

    /// A fields encoder raised, the path was invalid, or a payload-writer
    /// substitution failed — always a local, pre-send failure.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl IceRpcError {
    /// Wraps an arbitrary I/O/transport error.
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::TransportFailure(Box::new(err))
    }

    /// Maps this error to the [`DispatchErrorCode`] it should be encoded as
    /// when surfaced in a `icerpc` Failure response (spec §4.3 step 3,
    /// spec §8 scenario 8).
    pub fn to_dispatch_error_code(&self) -> DispatchErrorCode {
        match self {
            Self::DispatchFailure { code, .. } => *code,
            Self::InvalidData(_) | Self::InvalidArgument(_) => DispatchErrorCode::InvalidData,
            Self::Cancelled => DispatchErrorCode::Canceled,
            _ => DispatchErrorCode::UnhandledException,
        }
    }

    /// `true` if this is (or wraps) a [`IceRpcError::ConnectionClosed`].
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }

    /// `true` if this is (or wraps) a [`IceRpcError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Builds an equivalent error of the same variant. `IceRpcError` can't
    /// derive `Clone` because [`IceRpcError::TransportFailure`] boxes a
    /// `dyn Error`; every other variant is plain data, and the transport
    /// case is re-created from its display text so the terminal *kind* is
    /// still preserved for a second observer (e.g. a payload completion
    /// alongside the value returned to the caller).
    pub fn dup(&self) -> Self {
        match self {
            Self::TransportFailure(err) => {
                Self::TransportFailure(Box::new(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    err.to_string(),
                )))
            }
            Self::ProtocolFailure(message) => Self::ProtocolFailure(message.clone()),
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::DispatchFailure { code, message } => {
                Self::DispatchFailure { code: *code, message: message.clone() }
            }
            Self::InvalidData(message) => Self::InvalidData(message.clone()),
            Self::Cancelled => Self::Cancelled,
            Self::InvalidArgument(message) => Self::InvalidArgument(message.clone()),
        }
    }
}

/// Companion trait analogous to the teacher's `RpcError`/`MiddlewareError`:
/// gives interceptors and retry logic a way to introspect the terminal cause
/// of a layered error without downcasting through every wrapper.
pub trait ConnectionError: std::error::Error + Send + Sync {
    /// Borrow the underlying [`IceRpcError`], if this error is (or wraps) one.
    fn as_icerpc_error(&self) -> Option<&IceRpcError>;

    /// `true` if the underlying cause is connection-closed.
    fn is_closed(&self) -> bool {
        self.as_icerpc_error().map(IceRpcError::is_closed).unwrap_or(false)
    }

    /// `true` if the underlying cause is cancellation.
    fn is_cancelled(&self) -> bool {
        self.as_icerpc_error().map(IceRpcError::is_cancelled).unwrap_or(false)
    }
}

impl ConnectionError for IceRpcError {
    fn as_icerpc_error(&self) -> Option<&IceRpcError> {
        Some(self)
    }
}
