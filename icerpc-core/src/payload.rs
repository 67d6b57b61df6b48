//! [`PayloadSource`] / [`PayloadSink`]: the lazy, single-consumer byte-stream
//! abstraction request and response bodies are built from (spec §4.1).

use async_trait::async_trait;
use bytes::Bytes;

use crate::completion::{Completion, Outcome};
use crate::error::IceRpcError;

/// One `read` result: more bytes, or end of stream.
#[derive(Debug, Clone)]
pub enum PayloadChunk {
    /// More payload bytes. May be empty.
    Data(Bytes),
    /// No more bytes will ever be produced.
    Eof,
}

/// A lazy, single-consumer, possibly-empty, possibly-infinite byte sequence.
///
/// `complete` is called exactly once per source over its lifetime (spec
/// §4.1's core invariant). Readers that observe [`PayloadChunk::Eof`] MUST
/// still call `complete(Ok(()))` themselves if they own the source outright;
/// in this crate that responsibility is normally delegated to a
/// [`PayloadGuard`] so it happens on every code path, including panics and
/// early returns.
#[async_trait]
pub trait PayloadSource: Send {
    /// Reads the next chunk. Returns an error if the source failed, or if
    /// `read` is called again after `complete`.
    async fn read(&mut self) -> Result<PayloadChunk, IceRpcError>;

    /// Sets the terminal outcome. A no-op on every call after the first.
    fn complete(&mut self, outcome: Outcome);

    /// A cloneable handle observers can await to learn the terminal outcome.
    fn completion(&self) -> Completion;
}

/// Write-side dual of [`PayloadSource`]: bytes are pushed to the wire rather
/// than pulled from it.
#[async_trait]
pub trait PayloadSink: Send {
    /// Writes one chunk to the wire.
    async fn write(&mut self, chunk: Bytes) -> Result<(), IceRpcError>;

    /// Signals that no more chunks will be written for this outcome; flushes
    /// if `outcome` is `Ok`.
    async fn complete(&mut self, outcome: Outcome);

    /// A cloneable handle observers can await to learn the terminal outcome.
    fn completion(&self) -> Completion;
}

#[async_trait]
impl PayloadSource for Box<dyn PayloadSource> {
    async fn read(&mut self) -> Result<PayloadChunk, IceRpcError> {
        (**self).read().await
    }

    fn complete(&mut self, outcome: Outcome) {
        (**self).complete(outcome)
    }

    fn completion(&self) -> Completion {
        (**self).completion()
    }
}

/// A [`PayloadSource`] over an in-memory buffer: reads it once, then EOF.
#[derive(Debug)]
pub struct BytesPayload {
    data: Option<Bytes>,
    completion: Completion,
}

impl BytesPayload {
    /// Wraps `data` as a single-chunk payload source.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: Some(data.into()), completion: Completion::new() }
    }

    /// An already-empty payload source (spec §8 scenario 1: oneway with an
    /// empty reader).
    pub fn empty() -> Self {
        Self::new(Bytes::new())
    }
}

#[async_trait]
impl PayloadSource for BytesPayload {
    async fn read(&mut self) -> Result<PayloadChunk, IceRpcError> {
        if self.completion.is_completed() {
            return Err(IceRpcError::InvalidData("read after complete".into()));
        }
        match self.data.take() {
            Some(data) => Ok(PayloadChunk::Data(data)),
            None => Ok(PayloadChunk::Eof),
        }
    }

    fn complete(&mut self, outcome: Outcome) {
        self.completion.complete(outcome);
    }

    fn completion(&self) -> Completion {
        self.completion.clone()
    }
}

/// Owns a [`PayloadSource`]/[`PayloadSink`] for the duration of an
/// invoke/dispatch and guarantees `complete` is called exactly once, even on
/// early return, error, cancellation, or panic unwind (spec §9's "scoped
/// owner guard" design note — this is the invariant the whole test suite
/// probes).
///
/// Construct with the outcome to apply if the guard is dropped without an
/// explicit [`PayloadGuard::finish`] call — that's the catch-all for
/// cancellation and unexpected early returns.
pub struct PayloadGuard<P> {
    payload: Option<P>,
    drop_outcome: Outcome,
}

impl<P> PayloadGuard<P> {
    /// Takes ownership of `payload`; if dropped before `finish` is called,
    /// completes it with `drop_outcome`.
    pub fn new(payload: P, drop_outcome: Outcome) -> Self {
        Self { payload: Some(payload), drop_outcome }
    }

    /// Borrows the owned payload.
    pub fn get_mut(&mut self) -> &mut P {
        self.payload.as_mut().expect("payload taken twice")
    }

    /// Replaces the outcome that will be applied on drop (e.g. once the
    /// connection knows the send succeeded, switch the fallback from
    /// "cancelled" to "connection closed").
    pub fn set_drop_outcome(&mut self, outcome: Outcome) {
        self.drop_outcome = outcome;
    }
}

impl<P: PayloadSource> PayloadGuard<P> {
    /// Completes the payload with `outcome` and disarms the drop guard.
    pub fn finish(mut self, outcome: Outcome) {
        if let Some(mut payload) = self.payload.take() {
            payload.complete(outcome);
        }
    }
}

impl<P: PayloadSource> Drop for PayloadGuard<P> {
    fn drop(&mut self) {
        if let Some(mut payload) = self.payload.take() {
            let outcome = std::mem::replace(&mut self.drop_outcome, Ok(()));
            payload.complete(outcome);
        }
    }
}

impl<P: std::fmt::Debug> std::fmt::Debug for PayloadGuard<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadGuard").field("payload", &self.payload).finish()
    }
}
