//! The router's own failure modes, kept separate from [`icerpc_core::IceRpcError`]
//! the way the teacher keeps one focused error enum per concern rather than
//! one giant error type.

use icerpc_core::IceRpcError;
use thiserror::Error;

/// Failures raised by [`crate::Router`] itself, as opposed to failures
/// surfaced by a matched dispatcher.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RouterError {
    /// `Map`/`Mount`/`Use` called after the router already dispatched its
    /// first request.
    #[error("router is frozen: {0}")]
    IllegalState(String),

    /// The request path failed the router's own validation, independent of
    /// any matched dispatcher (missing absolute prefix, segment-cap hit).
    #[error("invalid path: {0}")]
    InvalidData(String),
}

impl From<RouterError> for IceRpcError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::IllegalState(msg) => IceRpcError::InvalidArgument(msg),
            RouterError::InvalidData(msg) => IceRpcError::InvalidData(msg),
        }
    }
}
