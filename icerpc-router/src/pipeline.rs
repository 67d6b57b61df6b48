//! [`Pipeline`]: the client-side dual of [`crate::Router`] — an ordered
//! stack of interceptors wrapping a terminal invoker (spec §4.5), plus the
//! [`RetryPolicy`] contract interceptors consult (spec §4.6).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use icerpc_core::{CancelToken, IceRpcError, IncomingResponse, Invoker, OutgoingRequest};

/// Transforms an [`OutgoingRequest`] on the way in and/or an
/// [`IncomingResponse`] on the way out, around a call to `next`. Registered
/// with [`PipelineBuilder::with_interceptor`] in the order each should run —
/// the first one added sees the request first and the response last, the
/// same "outermost wraps first" reading as the teacher's `Middleware::inner()`
/// chain, just composed dynamically instead of through nested generics
/// (interceptors are registered at runtime, not known at compile time).
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Handles `request`, typically calling `next.invoke(request, cancel)`
    /// somewhere in its body. An interceptor that never calls `next` short-
    /// circuits the chain (e.g. a cache hit).
    async fn intercept(
        &self,
        request: OutgoingRequest,
        cancel: CancelToken,
        next: &dyn Invoker,
    ) -> Result<IncomingResponse, IceRpcError>;
}

struct InterceptedInvoker {
    interceptor: Arc<dyn Interceptor>,
    inner: Arc<dyn Invoker>,
}

#[async_trait]
impl Invoker for InterceptedInvoker {
    async fn invoke(
        &self,
        request: OutgoingRequest,
        cancel: CancelToken,
    ) -> Result<IncomingResponse, IceRpcError> {
        self.interceptor.intercept(request, cancel, self.inner.as_ref()).await
    }
}

/// Builds a [`Pipeline`] by registering interceptors in call order, then
/// compiling them once around a terminal invoker (normally a protocol
/// connection).
pub struct PipelineBuilder {
    terminal: Arc<dyn Invoker>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl PipelineBuilder {
    /// Starts a pipeline terminating at `terminal`.
    pub fn new(terminal: Arc<dyn Invoker>) -> Self {
        Self { terminal, interceptors: Vec::new() }
    }

    /// Appends `interceptor`; it runs after every interceptor already added
    /// and before every one added afterwards.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Compiles the registered interceptors around the terminal invoker.
    pub fn build(self) -> Pipeline {
        let chain = self.interceptors.into_iter().rev().fold(self.terminal, |inner, interceptor| {
            Arc::new(InterceptedInvoker { interceptor, inner }) as Arc<dyn Invoker>
        });
        Pipeline { chain }
    }
}

/// An [`Invoker`] assembled from an ordered interceptor stack terminating at
/// a connection (spec §4.5). Immutable once built; reconfigure by building a
/// new one from a [`PipelineBuilder`].
#[derive(Clone)]
pub struct Pipeline {
    chain: Arc<dyn Invoker>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

#[async_trait]
impl Invoker for Pipeline {
    async fn invoke(
        &self,
        request: OutgoingRequest,
        cancel: CancelToken,
    ) -> Result<IncomingResponse, IceRpcError> {
        self.chain.invoke(request, cancel).await
    }
}

/// What a retry interceptor should do about a failed invocation (spec §4.6).
/// The core only produces this value; redriving the request — replaying its
/// payload, tracking `ExcludedEndpoints` — is the retry interceptor's job,
/// not this crate's. Same posture as the payload-writer compression hook:
/// this is the seam, not the policy engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryPolicy {
    /// Do not retry this request.
    NoRetry,
    /// Retry immediately, on any replica.
    Immediately,
    /// Retry on a different replica than the one just tried.
    OtherReplica,
    /// Retry after waiting `Duration`.
    AfterDelay(Duration),
}

/// Derives the [`RetryPolicy`] for a failed invocation (spec §4.6's core
/// contract). `dispatched` is `true` once the request is known to have
/// reached the peer's dispatcher — a request that has been observably
/// dispatched is never retried unless `idempotent`.
pub fn retry_policy_for(error: &IceRpcError, idempotent: bool, dispatched: bool) -> RetryPolicy {
    if dispatched && !idempotent {
        return RetryPolicy::NoRetry;
    }
    match error {
        IceRpcError::ConnectionClosed => RetryPolicy::OtherReplica,
        IceRpcError::TransportFailure(_) => RetryPolicy::Immediately,
        IceRpcError::Cancelled | IceRpcError::InvalidArgument(_) | IceRpcError::InvalidData(_) => {
            RetryPolicy::NoRetry
        }
        IceRpcError::DispatchFailure { .. } => RetryPolicy::NoRetry,
        IceRpcError::ProtocolFailure(_) => RetryPolicy::AfterDelay(Duration::from_millis(100)),
        _ => RetryPolicy::NoRetry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icerpc_core::payload::BytesPayload;
    use icerpc_core::{Proxy, ProtocolTag, ResultType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingInvoker(Arc<AtomicUsize>);

    #[async_trait]
    impl Invoker for CountingInvoker {
        async fn invoke(
            &self,
            _request: OutgoingRequest,
            _cancel: CancelToken,
        ) -> Result<IncomingResponse, IceRpcError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(IncomingResponse::new(
                ResultType::Success,
                "slice2",
                icerpc_core::Fields::new(),
                Box::new(BytesPayload::empty()),
            ))
        }
    }

    struct TagInterceptor(&'static str, Arc<std::sync::Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl Interceptor for TagInterceptor {
        async fn intercept(
            &self,
            request: OutgoingRequest,
            cancel: CancelToken,
            next: &dyn Invoker,
        ) -> Result<IncomingResponse, IceRpcError> {
            self.1.lock().unwrap().push(self.0);
            next.invoke(request, cancel).await
        }
    }

    fn request() -> OutgoingRequest {
        let proxy = Proxy::new(ProtocolTag::IceRpc, "/greeter").unwrap();
        OutgoingRequest::new(proxy, "sayHello", Box::new(BytesPayload::empty())).unwrap()
    }

    #[tokio::test]
    async fn interceptors_run_in_registration_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        let pipeline = PipelineBuilder::new(Arc::new(CountingInvoker(counter.clone())))
            .with_interceptor(Arc::new(TagInterceptor("first", log.clone())))
            .with_interceptor(Arc::new(TagInterceptor("second", log.clone())))
            .build();

        pipeline.invoke(request(), CancelToken::new()).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatched_non_idempotent_never_retries() {
        let policy = retry_policy_for(&IceRpcError::TransportFailure(Box::new(std::io::Error::new(std::io::ErrorKind::Other, "x"))), false, true);
        assert_eq!(policy, RetryPolicy::NoRetry);
    }

    #[test]
    fn dispatched_idempotent_still_gets_a_policy() {
        let policy = retry_policy_for(&IceRpcError::ConnectionClosed, true, true);
        assert_eq!(policy, RetryPolicy::OtherReplica);
    }

    #[test]
    fn not_yet_dispatched_failure_is_retryable() {
        let policy = retry_policy_for(&IceRpcError::TransportFailure(Box::new(std::io::Error::new(std::io::ErrorKind::Other, "x"))), false, false);
        assert_eq!(policy, RetryPolicy::Immediately);
    }
}
