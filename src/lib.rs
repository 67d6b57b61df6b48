#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

/// The shared data model: payloads, frames, fields, the error taxonomy.
///
/// Re-exports [`icerpc_core`] in full; most programs only need the names
/// already surfaced through [`prelude`].
pub mod core {
    pub use icerpc_core::*;
}

/// The two concrete protocol connections and the shutdown coordinator they
/// share.
///
/// Gated the same way the underlying crate gates them: the `ice` submodule
/// behind the `ice` feature, the `icerpc` submodule behind `icerpc-protocol`.
pub mod connection {
    pub use icerpc_connection::*;
}

/// Path-based server dispatch ([`Router`](router::Router)) and client-side
/// invocation pipelining ([`Pipeline`](router::Pipeline)).
pub mod router {
    pub use icerpc_router::*;
}

/// Commonly used types, re-exported flat for a single `use icerpc::prelude::*;`.
pub mod prelude {
    pub use icerpc_core::{
        CancelToken, Completion, DispatchErrorCode, Dispatcher, Endpoint, FieldKey, Fields,
        IceRpcError, Invoker, PayloadChunk, PayloadSink, PayloadSource,
    };
    pub use icerpc_core::{
        Deadline, IncomingRequest, IncomingResponse, OutgoingRequest, OutgoingResponse, ResultType,
    };
    pub use icerpc_core::{ProtocolTag, Proxy};

    pub use icerpc_connection::{ConnectionState, ProtocolConnection, ShutdownCoordinator};

    #[cfg(feature = "ice")]
    pub use icerpc_connection::{IceProtocolConnection, IceRole};

    #[cfg(feature = "icerpc-protocol")]
    pub use icerpc_connection::{IceRpcProtocolConnection, IceRpcRole};

    pub use icerpc_router::{
        retry_policy_for, DefaultDispatcher, Interceptor, Middleware, Pipeline, PipelineBuilder,
        RetryPolicy, Router, RouterError,
    };
}
