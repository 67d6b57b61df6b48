//! Request/response envelopes exchanged between a caller, a connection, and
//! a dispatcher (spec §3, §6.2).

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{DispatchErrorCode, IceRpcError};
use crate::fields::Fields;
use crate::payload::PayloadSource;
use crate::proxy::Proxy;

/// An absolute point in time a request must complete by, or the sentinel
/// "never" (spec §3, §6.2: encoded as milliseconds-since-epoch, -1 = never).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Deadline {
    /// No deadline; the request never times out on its own.
    Never,
    /// Milliseconds since the Unix epoch.
    At(i64),
}

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self::At((now + timeout).as_millis() as i64)
    }

    /// The wire encoding: milliseconds since epoch, or -1 for "never".
    pub fn to_millis(self) -> i64 {
        match self {
            Self::Never => -1,
            Self::At(ms) => ms,
        }
    }

    /// Decodes the wire encoding (spec §6.2: -1 means never).
    pub fn from_millis(ms: i64) -> Self {
        if ms == -1 {
            Self::Never
        } else {
            Self::At(ms)
        }
    }

    /// `true` if `now` (ms since epoch) is at or past this deadline.
    pub fn has_elapsed(self, now_ms: i64) -> bool {
        match self {
            Self::Never => false,
            Self::At(ms) => now_ms >= ms,
        }
    }
}

/// A request en route from caller to connection. Owned by the caller until
/// `Invoke` is awaited; once invocation begins the caller must not mutate it
/// (spec §3 invariant).
pub struct OutgoingRequest {
    proxy: Proxy,
    operation: String,
    idempotent: bool,
    oneway: bool,
    deadline: Deadline,
    payload: Box<dyn PayloadSource>,
    payload_stream: Option<Box<dyn PayloadSource>>,
    fields: Fields,
    field_encoders: Vec<(crate::fields::FieldKey, FieldEncoder)>,
    features: BTreeMap<String, String>,
}

/// An integer key's bytes, produced lazily and fallibly at encode time
/// rather than up front (spec §3: "integer key -> encoder callback").
type FieldEncoder = Box<dyn FnOnce() -> Result<bytes::Bytes, IceRpcError> + Send>;

impl OutgoingRequest {
    /// Builds a request targeting `proxy.path()`. `operation` must be
    /// non-empty (spec §3 invariant).
    pub fn new(
        proxy: Proxy,
        operation: impl Into<String>,
        payload: Box<dyn PayloadSource>,
    ) -> Result<Self, IceRpcError> {
        let operation = operation.into();
        if operation.is_empty() {
            return Err(IceRpcError::InvalidArgument("operation name must be non-empty".into()));
        }
        Ok(Self {
            proxy,
            operation,
            idempotent: false,
            oneway: false,
            deadline: Deadline::Never,
            payload,
            payload_stream: None,
            fields: Fields::new(),
            field_encoders: Vec::new(),
            features: BTreeMap::new(),
        })
    }

    /// Marks the request idempotent, permitting retry after an observed
    /// dispatch (spec §5.3).
    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Marks the request oneway: the caller does not wait for a response.
    pub fn with_oneway(mut self, oneway: bool) -> Self {
        self.oneway = oneway;
        self
    }

    /// Sets the request's deadline.
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// Attaches an optional second payload stream, sent after the main
    /// payload completes (spec §4.4 step 5).
    pub fn with_payload_stream(mut self, stream: Box<dyn PayloadSource>) -> Self {
        self.payload_stream = Some(stream);
        self
    }

    /// Wraps the main payload through `writer` — the seam a compression
    /// layer would hook into. No compressor ships in this crate; this only
    /// exists so one can be added without changing the request/response
    /// shape (spec §9).
    pub fn with_payload_writer(
        mut self,
        writer: impl FnOnce(Box<dyn PayloadSource>) -> Box<dyn PayloadSource>,
    ) -> Self {
        self.payload = writer(self.payload);
        self
    }

    /// Sets a raw, already-encoded field, to be merged with the
    /// auto-populated context field at encode time (spec §4.4 step 3).
    pub fn with_field(mut self, key: crate::fields::FieldKey, value: bytes::Bytes) -> Self {
        self.fields.insert(key, value);
        self
    }

    /// Registers a field whose bytes aren't known yet — the seam a
    /// generated proxy method's argument encoder hooks into. Run by
    /// [`OutgoingRequest::encode_fields`] immediately before the request is
    /// sent; a failing encoder fails the whole invocation with
    /// `InvalidArgument` (spec §3, §8 scenario 2).
    pub fn with_field_encoder(
        mut self,
        key: crate::fields::FieldKey,
        encode: impl FnOnce() -> Result<bytes::Bytes, IceRpcError> + Send + 'static,
    ) -> Self {
        self.field_encoders.push((key, Box::new(encode)));
        self
    }

    /// Runs every pending field encoder registered via
    /// [`OutgoingRequest::with_field_encoder`], merging successful results
    /// into the raw field map. The first encoder to fail short-circuits the
    /// rest and reports `InvalidArgument`, leaving the request's payload
    /// untouched so the caller can still complete it (spec §8 scenario 2).
    pub fn encode_fields(&mut self) -> Result<(), IceRpcError> {
        for (key, encode) in std::mem::take(&mut self.field_encoders) {
            match encode() {
                Ok(value) => {
                    self.fields.insert(key, value);
                }
                Err(e) => return Err(IceRpcError::InvalidArgument(e.to_string())),
            }
        }
        Ok(())
    }

    /// Sets a caller-local feature (not sent over the wire), e.g. a
    /// per-invocation retry override.
    pub fn with_feature(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.features.insert(key.into(), value.into());
        self
    }

    /// The target proxy.
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// The target path; always equal to `self.proxy().path()`.
    pub fn path(&self) -> &str {
        self.proxy.path()
    }

    /// The operation name.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// `true` if this request may be safely retried after a confirmed
    /// dispatch.
    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    /// `true` if the caller does not expect a response.
    pub fn is_oneway(&self) -> bool {
        self.oneway
    }

    /// The request's deadline.
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// The raw field map, excluding the context field populated at encode
    /// time.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// A caller-local feature, if set.
    pub fn feature(&self, key: &str) -> Option<&str> {
        self.features.get(key).map(String::as_str)
    }

    /// Borrows the main payload.
    pub fn payload_mut(&mut self) -> &mut dyn PayloadSource {
        self.payload.as_mut()
    }

    /// Takes ownership of the main payload, consuming the request.
    pub fn into_payload(self) -> Box<dyn PayloadSource> {
        self.payload
    }

    /// Borrows the optional second payload stream.
    pub fn payload_stream_mut(&mut self) -> Option<&mut dyn PayloadSource> {
        self.payload_stream.as_deref_mut()
    }

    /// Takes ownership of the optional second payload stream.
    pub fn into_payload_stream(self) -> Option<Box<dyn PayloadSource>> {
        self.payload_stream
    }
}

/// Which branch of a response arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    /// The dispatcher returned normally.
    Success,
    /// The dispatcher raised, or the core rejected the request.
    Failure,
}

/// A response as observed by the caller of `Invoke`.
pub struct IncomingResponse {
    result_type: ResultType,
    payload_encoding: String,
    fields: Fields,
    payload: Box<dyn PayloadSource>,
    payload_stream: Option<Box<dyn PayloadSource>>,
}

impl IncomingResponse {
    /// Constructs a response envelope from its decoded parts.
    pub fn new(
        result_type: ResultType,
        payload_encoding: impl Into<String>,
        fields: Fields,
        payload: Box<dyn PayloadSource>,
    ) -> Self {
        Self {
            result_type,
            payload_encoding: payload_encoding.into(),
            fields,
            payload,
            payload_stream: None,
        }
    }

    /// Attaches the optional second payload stream.
    pub fn with_payload_stream(mut self, stream: Box<dyn PayloadSource>) -> Self {
        self.payload_stream = Some(stream);
        self
    }

    /// `Success` or `Failure`.
    pub fn result_type(&self) -> ResultType {
        self.result_type
    }

    /// The response body's encoding tag.
    pub fn payload_encoding(&self) -> &str {
        &self.payload_encoding
    }

    /// The decoded field map.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Borrows the response payload.
    pub fn payload_mut(&mut self) -> &mut dyn PayloadSource {
        self.payload.as_mut()
    }

    /// Takes ownership of the response payload, consuming the response.
    pub fn into_payload(self) -> Box<dyn PayloadSource> {
        self.payload
    }

    /// Borrows the optional second payload stream.
    pub fn payload_stream_mut(&mut self) -> Option<&mut dyn PayloadSource> {
        self.payload_stream.as_deref_mut()
    }
}

/// A request as observed by a dispatcher. Dual of [`OutgoingRequest`] on the
/// server side, with the same exactly-once payload-completion invariant.
pub struct IncomingRequest {
    path: String,
    operation: String,
    idempotent: bool,
    deadline: Deadline,
    fields: Fields,
    payload: Box<dyn PayloadSource>,
    payload_stream: Option<Box<dyn PayloadSource>>,
}

impl IncomingRequest {
    /// Constructs a request envelope from its decoded header and payload.
    pub fn new(
        path: impl Into<String>,
        operation: impl Into<String>,
        idempotent: bool,
        deadline: Deadline,
        fields: Fields,
        payload: Box<dyn PayloadSource>,
    ) -> Self {
        Self {
            path: path.into(),
            operation: operation.into(),
            idempotent,
            deadline,
            fields,
            payload,
            payload_stream: None,
        }
    }

    /// Attaches the optional second payload stream.
    pub fn with_payload_stream(mut self, stream: Box<dyn PayloadSource>) -> Self {
        self.payload_stream = Some(stream);
        self
    }

    /// The target path, used by the router to select a dispatcher.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The operation name.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// `true` if the caller marked this request idempotent.
    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    /// The caller's deadline, echoed so the handler can honor it.
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// The decoded field map.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Borrows the request payload.
    pub fn payload_mut(&mut self) -> &mut dyn PayloadSource {
        self.payload.as_mut()
    }

    /// Takes ownership of the request payload, consuming the request.
    pub fn into_payload(self) -> Box<dyn PayloadSource> {
        self.payload
    }

    /// Borrows the optional second payload stream.
    pub fn payload_stream_mut(&mut self) -> Option<&mut dyn PayloadSource> {
        self.payload_stream.as_deref_mut()
    }
}

/// A response as produced by a dispatcher. Dual of [`IncomingResponse`].
pub struct OutgoingResponse {
    result_type: ResultType,
    payload_encoding: String,
    fields: Fields,
    payload: Box<dyn PayloadSource>,
    payload_stream: Option<Box<dyn PayloadSource>>,
    error_code: Option<DispatchErrorCode>,
}

impl OutgoingResponse {
    /// Builds a successful response.
    pub fn success(payload_encoding: impl Into<String>, payload: Box<dyn PayloadSource>) -> Self {
        Self {
            result_type: ResultType::Success,
            payload_encoding: payload_encoding.into(),
            fields: Fields::new(),
            payload,
            payload_stream: None,
            error_code: None,
        }
    }

    /// Builds a failure response carrying `message` in its payload, tagged
    /// with `UnhandledException` until overridden by
    /// [`OutgoingResponse::with_error_code`] (spec §8 scenario 8).
    pub fn failure(
        payload_encoding: impl Into<String>,
        payload: Box<dyn PayloadSource>,
    ) -> Self {
        Self {
            result_type: ResultType::Failure,
            payload_encoding: payload_encoding.into(),
            fields: Fields::new(),
            payload,
            payload_stream: None,
            error_code: Some(DispatchErrorCode::UnhandledException),
        }
    }

    /// Overrides the [`DispatchErrorCode`] a failure response is reported to
    /// the peer as — the dispatcher's actual cause, rather than the generic
    /// `UnhandledException` default (spec §4.3 step 3, §8 scenario 8).
    pub fn with_error_code(mut self, code: DispatchErrorCode) -> Self {
        self.error_code = Some(code);
        self
    }

    /// The [`DispatchErrorCode`] to report this response as, if it's a
    /// failure.
    pub fn error_code(&self) -> Option<DispatchErrorCode> {
        self.error_code
    }

    /// Sets a raw field on the response.
    pub fn with_field(mut self, key: crate::fields::FieldKey, value: bytes::Bytes) -> Self {
        self.fields.insert(key, value);
        self
    }

    /// Attaches the optional second payload stream.
    pub fn with_payload_stream(mut self, stream: Box<dyn PayloadSource>) -> Self {
        self.payload_stream = Some(stream);
        self
    }

    /// Wraps the payload through `writer` — the same compression seam
    /// [`OutgoingRequest::with_payload_writer`] exposes on the request side.
    pub fn with_payload_writer(
        mut self,
        writer: impl FnOnce(Box<dyn PayloadSource>) -> Box<dyn PayloadSource>,
    ) -> Self {
        self.payload = writer(self.payload);
        self
    }

    /// `Success` or `Failure`.
    pub fn result_type(&self) -> ResultType {
        self.result_type
    }

    /// The response body's encoding tag.
    pub fn payload_encoding(&self) -> &str {
        &self.payload_encoding
    }

    /// The field map to be encoded onto the wire.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Borrows the response payload.
    pub fn payload_mut(&mut self) -> &mut dyn PayloadSource {
        self.payload.as_mut()
    }

    /// Takes ownership of the response payload, consuming the response.
    pub fn into_payload(self) -> Box<dyn PayloadSource> {
        self.payload
    }

    /// Takes ownership of the optional second payload stream.
    pub fn into_payload_stream(self) -> Option<Box<dyn PayloadSource>> {
        self.payload_stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::BytesPayload;
    use crate::proxy::ProtocolTag;

    #[test]
    fn deadline_millis_round_trips() {
        assert_eq!(Deadline::from_millis(-1), Deadline::Never);
        assert_eq!(Deadline::from_millis(42).to_millis(), 42);
        assert!(Deadline::At(10).has_elapsed(10));
        assert!(!Deadline::At(10).has_elapsed(9));
        assert!(!Deadline::Never.has_elapsed(i64::MAX));
    }

    #[test]
    fn rejects_empty_operation_name() {
        let proxy = Proxy::new(ProtocolTag::IceRpc, "/greeter").unwrap();
        let err = OutgoingRequest::new(proxy, "", Box::new(BytesPayload::empty()));
        assert!(err.is_err());
    }

    #[test]
    fn request_path_matches_proxy_path() {
        let proxy = Proxy::new(ProtocolTag::IceRpc, "/greeter").unwrap();
        let request =
            OutgoingRequest::new(proxy, "sayHello", Box::new(BytesPayload::empty())).unwrap();
        assert_eq!(request.path(), "/greeter");
    }
}
