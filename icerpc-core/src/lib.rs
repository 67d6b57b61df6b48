#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]
#![doc = include_str!("../README.md")]

//! Data model and payload lifecycle primitives shared by both wire protocols.
//!
//! This crate treats request/response bodies as opaque byte streams: it owns
//! the [`PayloadSource`]/[`PayloadSink`] lifecycle contract, the wire-agnostic
//! [`Frame`] types, the integer-keyed [`fields`] codec, and the error
//! taxonomy. It knows nothing about `ice` or `icerpc` framing; that lives in
//! `icerpc-connection`.

pub mod cancel;
pub mod completion;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod fields;
pub mod frame;
pub mod payload;
pub mod proxy;
pub mod varint;

pub use cancel::CancelToken;
pub use completion::Completion;
pub use dispatch::{Dispatcher, Invoker};
pub use endpoint::Endpoint;
pub use error::{DispatchErrorCode, IceRpcError};
pub use fields::{FieldKey, Fields, FieldsCodec};
pub use frame::{
    Deadline, IncomingRequest, IncomingResponse, OutgoingRequest, OutgoingResponse, ResultType,
};
pub use payload::{PayloadChunk, PayloadGuard, PayloadSink, PayloadSource};
pub use proxy::{ProtocolTag, Proxy};
