//! The `Completed` future observable on a [`crate::PayloadSource`] or
//! [`crate::PayloadSink`] (spec §4.1).
//!
//! `complete` is idempotent only in the sense that the *first* call sets the
//! outcome; later calls are no-ops. Any number of tasks may await
//! [`Completion::wait`] concurrently, but only the owner calls
//! [`Completion::complete`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::watch;

use crate::error::IceRpcError;

/// `Ok(())` means the payload was fully consumed and handed off successfully;
/// `Err` carries the terminal cause (spec §4.1 outcome taxonomy). Wrapped in
/// an `Arc` so every observer of [`Completion::wait`] gets the real variant
/// back rather than a re-stringified approximation of it.
pub type Outcome = Result<(), Arc<IceRpcError>>;

#[derive(Debug)]
struct Inner {
    completed: AtomicBool,
    tx: watch::Sender<Option<Outcome>>,
}

/// A cloneable handle to a payload's completion outcome.
///
/// Cloning gives every observer (the connection, a decorator, a test) its own
/// handle to the same underlying slot; only whichever holder calls
/// [`Completion::complete`] first determines the outcome.
#[derive(Debug, Clone)]
pub struct Completion {
    inner: Arc<Inner>,
    rx: watch::Receiver<Option<Outcome>>,
}

impl Completion {
    /// Creates a fresh, not-yet-completed handle.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self { inner: Arc::new(Inner { completed: AtomicBool::new(false), tx }), rx }
    }

    /// Sets the terminal outcome. A no-op if already completed.
    pub fn complete(&self, outcome: Outcome) {
        if self.inner.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        // The receiver side (`self.rx`) is always alive because `self` holds
        // one, so `send` cannot fail.
        let _ = self.inner.tx.send(Some(outcome));
    }

    /// `true` once [`Completion::complete`] has been called.
    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Waits for the outcome, cloning it out once set.
    pub async fn wait(&self) -> Outcome {
        let mut rx = self.rx.clone();
        loop {
            if let Some(outcome) = rx.borrow().as_ref() {
                return outcome.clone();
            }
            if rx.changed().await.is_err() {
                // Sender dropped without completing: treat as a connection
                // failure rather than hanging forever.
                return Err(Arc::new(IceRpcError::ConnectionClosed));
            }
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
