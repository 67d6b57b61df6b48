//! Cross-module scenario: a `Router` wrapped in middleware, invoked through a
//! `Pipeline` wrapped in interceptors, end to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use icerpc_core::payload::BytesPayload;
use icerpc_core::{
    CancelToken, Dispatcher, Deadline, Fields, IceRpcError, IncomingRequest, IncomingResponse,
    Invoker, OutgoingRequest, OutgoingResponse, ProtocolTag, Proxy, ResultType,
};
use icerpc_router::{Interceptor, Middleware, PipelineBuilder, Router};

struct Greeter;

#[async_trait]
impl Dispatcher for Greeter {
    async fn dispatch(&self, _request: IncomingRequest, _cancel: CancelToken) -> OutgoingResponse {
        OutgoingResponse::success("slice2", Box::new(BytesPayload::new(&b"hi"[..])))
    }
}

struct CountingInvoker;

#[async_trait]
impl Invoker for CountingInvoker {
    async fn invoke(
        &self,
        _request: OutgoingRequest,
        _cancel: CancelToken,
    ) -> Result<IncomingResponse, IceRpcError> {
        Ok(IncomingResponse::new(
            ResultType::Success,
            "slice2",
            Fields::new(),
            Box::new(BytesPayload::new(&b"hi"[..])),
        ))
    }
}

struct CountingMiddleware(Arc<AtomicUsize>);

struct Counted {
    inner: Arc<dyn Dispatcher>,
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl Dispatcher for Counted {
    async fn dispatch(&self, request: IncomingRequest, cancel: CancelToken) -> OutgoingResponse {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.inner.dispatch(request, cancel).await
    }
}

impl Middleware for CountingMiddleware {
    fn layer(&self, inner: Arc<dyn Dispatcher>) -> Arc<dyn Dispatcher> {
        Arc::new(Counted { inner, count: self.0.clone() })
    }
}

struct CountingInterceptor(Arc<AtomicUsize>);

#[async_trait]
impl Interceptor for CountingInterceptor {
    async fn intercept(
        &self,
        request: OutgoingRequest,
        cancel: CancelToken,
        next: &dyn Invoker,
    ) -> Result<IncomingResponse, IceRpcError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        next.invoke(request, cancel).await
    }
}

#[tokio::test]
async fn router_runs_middleware_around_the_matched_dispatcher() {
    let hits = Arc::new(AtomicUsize::new(0));
    let mut router = Router::new();
    router.map("/greeter", Arc::new(Greeter)).unwrap();
    router.use_middleware(Arc::new(CountingMiddleware(hits.clone()))).unwrap();

    let request = IncomingRequest::new(
        "/greeter",
        "sayHello",
        false,
        Deadline::Never,
        Fields::new(),
        Box::new(BytesPayload::empty()),
    );
    let response = router.dispatch(request, CancelToken::new()).await;

    assert_eq!(response.result_type(), ResultType::Success);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pipeline_runs_interceptors_around_the_terminal_invoker() {
    let hits = Arc::new(AtomicUsize::new(0));
    let pipeline = PipelineBuilder::new(Arc::new(CountingInvoker))
        .with_interceptor(Arc::new(CountingInterceptor(hits.clone())))
        .build();

    let proxy = Proxy::new(ProtocolTag::IceRpc, "/greeter").unwrap();
    let request = OutgoingRequest::new(proxy, "sayHello", Box::new(BytesPayload::empty())).unwrap();
    let response = pipeline.invoke(request, CancelToken::new()).await.unwrap();

    assert_eq!(response.result_type(), ResultType::Success);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
