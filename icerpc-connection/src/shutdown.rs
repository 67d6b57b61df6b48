//! The shutdown/cancellation coordinator shared by both protocols (spec
//! §4.7).

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use icerpc_core::{CancelToken, IceRpcError};
use tokio::sync::{watch, Notify};
use tracing::debug;

/// The connection's lifecycle state (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting new invocations and dispatches.
    Active,
    /// Draining in-flight work; new invocations fail with `ConnectionClosed`.
    ShuttingDown,
    /// Torn down; nothing further succeeds.
    Closed,
}

struct Inner {
    state_tx: watch::Sender<ConnectionState>,
    dispatches: AtomicI64,
    invocations: AtomicI64,
    drained: Notify,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("state", &*self.state_tx.borrow())
            .field("dispatches", &self.dispatches.load(Ordering::Relaxed))
            .field("invocations", &self.invocations.load(Ordering::Relaxed))
            .finish()
    }
}

/// Tracks in-flight dispatches/invocations and drives the `Active ->
/// ShuttingDown -> Closed` transition (spec §4.7, §8 shutdown-drain /
/// shutdown-cancel invariants).
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ShutdownCoordinator {
    /// A fresh coordinator in `Active` state.
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Active);
        Self {
            inner: Arc::new(Inner {
                state_tx,
                dispatches: AtomicI64::new(0),
                invocations: AtomicI64::new(0),
                drained: Notify::new(),
            }),
            state_rx,
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// `true` while `state() == Active`.
    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// `true` while one or more dispatches are in flight.
    pub fn has_dispatches_in_progress(&self) -> bool {
        self.inner.dispatches.load(Ordering::Acquire) > 0
    }

    /// `true` while one or more invocations are in flight.
    pub fn has_invocations_in_progress(&self) -> bool {
        self.inner.invocations.load(Ordering::Acquire) > 0
    }

    /// Registers a new invocation, or fails with `ConnectionClosed` if the
    /// connection is no longer `Active` (spec §8 scenario 3).
    pub fn begin_invocation(&self) -> Result<InvocationGuard, IceRpcError> {
        if !self.is_active() {
            return Err(IceRpcError::ConnectionClosed);
        }
        self.inner.invocations.fetch_add(1, Ordering::AcqRel);
        Ok(InvocationGuard { coordinator: self.clone() })
    }

    /// Registers a new dispatch, or fails with `ConnectionClosed` if the
    /// connection is no longer `Active` (spec §4.3 AcceptRequests: "new
    /// accepted streams are refused").
    pub fn begin_dispatch(&self) -> Result<DispatchGuard, IceRpcError> {
        if !self.is_active() {
            return Err(IceRpcError::ConnectionClosed);
        }
        self.inner.dispatches.fetch_add(1, Ordering::AcqRel);
        Ok(DispatchGuard { coordinator: self.clone() })
    }

    fn end_invocation(&self) {
        self.inner.invocations.fetch_sub(1, Ordering::AcqRel);
        self.wake_if_drained();
    }

    fn end_dispatch(&self) {
        self.inner.dispatches.fetch_sub(1, Ordering::AcqRel);
        self.wake_if_drained();
    }

    fn wake_if_drained(&self) {
        if !self.is_active() && !self.has_dispatches_in_progress() && !self.has_invocations_in_progress()
        {
            self.inner.drained.notify_waiters();
        }
    }

    /// Transitions `Active -> ShuttingDown` (idempotent) and waits for both
    /// in-flight counters to reach zero before returning. If `cancel` fires
    /// first, every in-flight dispatch observes cancellation through
    /// `dispatch_cancel_token`, every in-flight invocation observes it
    /// through `invocation_cancel_token`, and pending invocations fail with
    /// `Cancelled` (spec §4.7, §8 shutdown-cancel).
    ///
    /// Shutdown itself always completes, whether or not `cancel` fired.
    pub async fn shutdown(
        &self,
        dispatch_cancel_token: &CancelToken,
        invocation_cancel_token: &CancelToken,
        cancel: CancelToken,
    ) {
        let _ = self.inner.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Active {
                *state = ConnectionState::ShuttingDown;
                true
            } else {
                false
            }
        });
        debug!(
            dispatches = self.inner.dispatches.load(Ordering::Relaxed),
            invocations = self.inner.invocations.load(Ordering::Relaxed),
            "connection entering ShuttingDown"
        );

        if !self.has_dispatches_in_progress() && !self.has_invocations_in_progress() {
            self.finish();
            return;
        }

        let drained = self.inner.drained.notified();
        tokio::select! {
            _ = drained => {}
            _ = cancel.cancelled() => {
                debug!("shutdown cancel token fired, propagating cancellation to in-flight work");
                // Register interest before cancelling so the notification
                // from the last guard to drop can't fire before we're
                // listening for it.
                let redrained = self.inner.drained.notified();
                dispatch_cancel_token.cancel();
                invocation_cancel_token.cancel();
                redrained.await;
            }
        }
        self.finish();
    }

    fn finish(&self) {
        let _ = self.inner.state_tx.send_if_modified(|state| {
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Closed;
                true
            } else {
                false
            }
        });
        debug!("connection Closed");
    }

    /// Hard abort: transitions directly to `Closed` without waiting for
    /// in-flight work to drain (spec §4.7 Dispose).
    pub fn dispose(&self) {
        let _ = self.inner.state_tx.send_if_modified(|state| {
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Closed;
                true
            } else {
                false
            }
        });
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle decrementing the invocations-in-progress counter on drop,
/// covering every exit path (success, error, cancellation, panic unwind).
#[derive(Debug)]
pub struct InvocationGuard {
    coordinator: ShutdownCoordinator,
}

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        self.coordinator.end_invocation();
    }
}

/// RAII handle decrementing the dispatches-in-progress counter on drop.
#[derive(Debug)]
pub struct DispatchGuard {
    coordinator: ShutdownCoordinator,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.coordinator.end_dispatch();
    }
}
