//! [`Router`]: path-based dispatch table plus a middleware stack, itself a
//! [`Dispatcher`] so it composes with another [`Router`] via `Mount`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use icerpc_core::error::DispatchErrorCode;
use icerpc_core::payload::BytesPayload;
use icerpc_core::{CancelToken, Dispatcher, IncomingRequest, OutgoingResponse};
use tracing::trace;

use crate::error::RouterError;

/// The longest chain of segment-trims `DispatchAsync` will try before giving
/// up on a path (defensive against adversarial paths with many segments).
pub const MAX_SEGMENTS: usize = 10;

/// Wraps the dispatcher `Router::dispatch` would otherwise call, producing a
/// replacement dispatcher. Registered with [`Router::use_middleware`];
/// composed last-pushed-outermost, the same stacking order the teacher's
/// `Middleware::inner()` chain reads in.
pub trait Middleware: Send + Sync {
    /// Wraps `inner` — the dispatcher this middleware sits in front of.
    fn layer(&self, inner: Arc<dyn Dispatcher>) -> Arc<dyn Dispatcher>;
}

impl<F> Middleware for F
where
    F: Fn(Arc<dyn Dispatcher>) -> Arc<dyn Dispatcher> + Send + Sync,
{
    fn layer(&self, inner: Arc<dyn Dispatcher>) -> Arc<dyn Dispatcher> {
        self(inner)
    }
}

/// A [`Dispatcher`] that routes by path (exact match, then longest mounted
/// prefix) and runs registered middleware around the match.
///
/// Construction (`map`/`mount`/`use_middleware`) is only legal before the
/// first `dispatch`; the pipeline is frozen on first use and later mutation
/// attempts fail with [`RouterError::IllegalState`].
pub struct Router {
    absolute_prefix: Option<String>,
    routes: BTreeMap<String, Arc<dyn Dispatcher>>,
    mounts: BTreeMap<String, Arc<dyn Dispatcher>>,
    middleware: Vec<Arc<dyn Middleware>>,
    frozen: AtomicBool,
    compiled: OnceLock<Arc<dyn Dispatcher>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("absolute_prefix", &self.absolute_prefix)
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .field("mounts", &self.mounts.keys().collect::<Vec<_>>())
            .field("middleware_count", &self.middleware.len())
            .field("frozen", &self.frozen.load(Ordering::Acquire))
            .finish()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// An empty router with no absolute prefix; unmatched paths fall back to
    /// [`DefaultDispatcher`].
    pub fn new() -> Self {
        Self {
            absolute_prefix: None,
            routes: BTreeMap::new(),
            mounts: BTreeMap::new(),
            middleware: Vec::new(),
            frozen: AtomicBool::new(false),
            compiled: OnceLock::new(),
        }
    }

    /// Every request path must start with `prefix`; the prefix is stripped
    /// before matching.
    pub fn with_absolute_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.absolute_prefix = Some(normalize_prefix(&prefix.into()));
        self
    }

    /// Registers `dispatcher` for an exact path match.
    pub fn map(&mut self, path: impl Into<String>, dispatcher: Arc<dyn Dispatcher>) -> Result<(), RouterError> {
        self.check_mutable()?;
        self.routes.insert(path.into(), dispatcher);
        Ok(())
    }

    /// Registers `dispatcher` for longest-prefix match under `prefix`.
    pub fn mount(&mut self, prefix: impl Into<String>, dispatcher: Arc<dyn Dispatcher>) -> Result<(), RouterError> {
        self.check_mutable()?;
        self.mounts.insert(normalize_prefix(&prefix.into()), dispatcher);
        Ok(())
    }

    /// Prepends `middleware` to the stack; the last one pushed wraps
    /// outermost, so it sees the request first and the response last.
    pub fn use_middleware(&mut self, middleware: Arc<dyn Middleware>) -> Result<(), RouterError> {
        self.check_mutable()?;
        self.middleware.push(middleware);
        Ok(())
    }

    fn check_mutable(&self) -> Result<(), RouterError> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(RouterError::IllegalState(
                "router already dispatched a request; Map/Mount/Use are no longer legal".into(),
            ));
        }
        Ok(())
    }

    fn compiled(&self) -> Arc<dyn Dispatcher> {
        self.compiled
            .get_or_init(|| {
                self.frozen.store(true, Ordering::Release);
                let base: Arc<dyn Dispatcher> = Arc::new(RouteMatcher {
                    absolute_prefix: self.absolute_prefix.clone(),
                    routes: self.routes.clone(),
                    mounts: self.mounts.clone(),
                });
                self.middleware.iter().rev().fold(base, |inner, mw| mw.layer(inner))
            })
            .clone()
    }
}

#[async_trait]
impl Dispatcher for Router {
    async fn dispatch(&self, request: IncomingRequest, cancel: CancelToken) -> OutgoingResponse {
        self.compiled().dispatch(request, cancel).await
    }
}

/// The innermost stage of a compiled [`Router`]: pure path resolution, run
/// after every registered middleware.
struct RouteMatcher {
    absolute_prefix: Option<String>,
    routes: BTreeMap<String, Arc<dyn Dispatcher>>,
    mounts: BTreeMap<String, Arc<dyn Dispatcher>>,
}

#[async_trait]
impl Dispatcher for RouteMatcher {
    async fn dispatch(&self, request: IncomingRequest, cancel: CancelToken) -> OutgoingResponse {
        match resolve_path(self.absolute_prefix.as_deref(), request.path(), &self.routes, &self.mounts) {
            Ok(dispatcher) => {
                trace!(path = request.path(), "router matched dispatcher");
                dispatcher.dispatch(request, cancel).await
            }
            Err(e) => failure_response(DispatchErrorCode::InvalidData, e.to_string()),
        }
    }
}

/// Exact match, then longest mounted prefix, trimming one segment per
/// attempt up to [`MAX_SEGMENTS`] (spec §4.4 steps 2-4).
fn resolve_path(
    absolute_prefix: Option<&str>,
    path: &str,
    routes: &BTreeMap<String, Arc<dyn Dispatcher>>,
    mounts: &BTreeMap<String, Arc<dyn Dispatcher>>,
) -> Result<Arc<dyn Dispatcher>, RouterError> {
    let remainder = match absolute_prefix {
        Some(prefix) => path.strip_prefix(prefix).ok_or_else(|| {
            RouterError::InvalidData(format!("path {path} does not start with required prefix {prefix}"))
        })?,
        None => path,
    };

    if let Some(dispatcher) = routes.get(remainder) {
        return Ok(dispatcher.clone());
    }

    let mut candidate = normalize_prefix(remainder);
    for attempt in 0..MAX_SEGMENTS {
        if let Some(dispatcher) = mounts.get(&candidate) {
            return Ok(dispatcher.clone());
        }
        if candidate == "/" {
            return Ok(Arc::new(DefaultDispatcher));
        }
        candidate = match candidate.rsplit_once('/') {
            Some(("", _)) => "/".to_string(),
            Some((rest, _)) => rest.to_string(),
            None => "/".to_string(),
        };
        if attempt + 1 == MAX_SEGMENTS {
            return Err(RouterError::InvalidData("too many segments in path".into()));
        }
    }
    Ok(Arc::new(DefaultDispatcher))
}

/// The dispatcher every unmatched path falls back to: a `ServiceNotFound`
/// failure response, by convention (spec §4.4 step 3).
#[derive(Debug, Clone, Copy)]
pub struct DefaultDispatcher;

#[async_trait]
impl Dispatcher for DefaultDispatcher {
    async fn dispatch(&self, request: IncomingRequest, _cancel: CancelToken) -> OutgoingResponse {
        failure_response(
            DispatchErrorCode::ServiceNotFound,
            format!("no dispatcher registered for path {}", request.path()),
        )
    }
}

/// Encodes `code` + `message` as the router's own wire-agnostic failure
/// payload: a one-byte code tag followed by the UTF-8 message. Connections
/// treat this as an opaque payload, same as any application-level failure.
pub(crate) fn failure_response(code: DispatchErrorCode, message: String) -> OutgoingResponse {
    let mut body = Vec::with_capacity(message.len() + 1);
    body.push(match code {
        DispatchErrorCode::ServiceNotFound => 0,
        DispatchErrorCode::OperationNotFound => 1,
        DispatchErrorCode::InvalidData => 2,
        DispatchErrorCode::UnhandledException => 3,
        DispatchErrorCode::Canceled => 4,
        // `DispatchErrorCode` is `#[non_exhaustive]`; new variants fall back
        // to the generic unhandled-exception tag rather than failing to build.
        _ => 3,
    });
    body.extend_from_slice(message.as_bytes());
    OutgoingResponse::failure("icerpc-router-error", Box::new(BytesPayload::new(Bytes::from(body))))
        .with_error_code(code)
}

/// Trims trailing slashes from `prefix`, except the root, which stays `/`.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icerpc_core::payload::BytesPayload;
    use icerpc_core::{Deadline, Fields, ResultType};

    fn ok_dispatcher() -> Arc<dyn Dispatcher> {
        struct Ok200;
        #[async_trait]
        impl Dispatcher for Ok200 {
            async fn dispatch(&self, _request: IncomingRequest, _cancel: CancelToken) -> OutgoingResponse {
                OutgoingResponse::success("slice2", Box::new(BytesPayload::empty()))
            }
        }
        Arc::new(Ok200)
    }

    fn request(path: &str) -> IncomingRequest {
        IncomingRequest::new(
            path,
            "op",
            false,
            Deadline::Never,
            Fields::new(),
            Box::new(BytesPayload::empty()),
        )
    }

    #[tokio::test]
    async fn exact_match_wins_over_mount() {
        let mut router = Router::new();
        router.map("/greeter", ok_dispatcher()).unwrap();
        router.mount("/", ok_dispatcher()).unwrap();
        let response = router.dispatch(request("/greeter"), CancelToken::new()).await;
        assert_eq!(response.result_type(), ResultType::Success);
    }

    #[tokio::test]
    async fn longest_prefix_mount_matches() {
        let mut router = Router::new();
        router.mount("/chat", ok_dispatcher()).unwrap();
        let response = router.dispatch(request("/chat/room/general"), CancelToken::new()).await;
        assert_eq!(response.result_type(), ResultType::Success);
    }

    #[tokio::test]
    async fn unmatched_path_falls_back_to_default() {
        let router = Router::new();
        let response = router.dispatch(request("/nope"), CancelToken::new()).await;
        assert_eq!(response.result_type(), ResultType::Failure);
    }

    #[tokio::test]
    async fn absolute_prefix_is_required_and_stripped() {
        let mut router = Router::new().with_absolute_prefix("/api");
        router.map("/greeter", ok_dispatcher()).unwrap();
        let response = router.dispatch(request("/api/greeter"), CancelToken::new()).await;
        assert_eq!(response.result_type(), ResultType::Success);

        let rejected = router.dispatch(request("/greeter"), CancelToken::new()).await;
        assert_eq!(rejected.result_type(), ResultType::Failure);
    }

    #[tokio::test]
    async fn mutation_after_first_dispatch_is_illegal() {
        let mut router = Router::new();
        let _ = router.dispatch(request("/x"), CancelToken::new()).await;
        assert!(router.map("/late", ok_dispatcher()).is_err());
    }

    #[test]
    fn normalize_prefix_keeps_root() {
        assert_eq!(normalize_prefix("/"), "/");
        assert_eq!(normalize_prefix("/chat/"), "/chat");
        assert_eq!(normalize_prefix(""), "/");
    }
}
