#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]
#![doc = include_str!("../README.md")]

//! Path-based dispatch and invocation pipelining built on top of
//! [`icerpc_core::Dispatcher`]/[`icerpc_core::Invoker`] (spec §4.4, §4.5,
//! §4.6). Neither [`Router`] nor [`Pipeline`] owns a transport; both wrap a
//! connection supplied by `icerpc-connection`.

mod error;
mod pipeline;
mod router;

pub use error::RouterError;
pub use pipeline::{retry_policy_for, Interceptor, Pipeline, PipelineBuilder, RetryPolicy};
pub use router::{DefaultDispatcher, Middleware, Router, MAX_SEGMENTS};
