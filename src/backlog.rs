//! Bounded backlog bridging push-style arrival to pull-style accept.
//!
//! A transport that reports new units through a callback or a driver task
//! (incoming connections, incoming streams) pushes them into a [`Backlog`];
//! `accept()`/`accept_stream()` pop them. Closing the owner triggers the
//! backlog's [`ShutdownSignal`], which unblocks every producer and consumer.

use crate::error::{Error, Result};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default backlog capacity.
pub const DEFAULT_BACKLOG: usize = 4096;

/// One-shot, idempotent "closed" broadcast.
///
/// Clones share state. The open -> closed transition happens exactly once;
/// [`ShutdownSignal::trigger`] returns `true` only for the caller that
/// performed it, so teardown guarded by it runs once.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug, Default)]
struct SignalInner {
    token: CancellationToken,
    reason: OnceLock<Option<Arc<Error>>>,
    parent: Option<ShutdownSignal>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that fires on its own or when `self` fires.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                token: self.inner.token.child_token(),
                reason: OnceLock::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Close, recording `reason` (`None` for a clean close).
    ///
    /// Returns `true` if this call performed the transition.
    pub fn trigger(&self, reason: Option<Error>) -> bool {
        let mut won = false;
        self.inner.reason.get_or_init(|| {
            won = true;
            reason.map(Arc::new)
        });
        if won {
            self.inner.token.cancel();
        }
        won
    }

    /// Whether the signal has fired (directly or through a parent).
    pub fn is_triggered(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the signal fires.
    pub async fn triggered(&self) {
        self.inner.token.cancelled().await
    }

    /// The error every waiter receives after the signal fired.
    ///
    /// A child fired by its parent reports the parent's reason.
    pub fn error(&self) -> Error {
        match (self.inner.reason.get(), &self.inner.parent) {
            (Some(Some(reason)), _) => Error::Shutdown(reason.clone()),
            (None, Some(parent)) if parent.is_triggered() => parent.error(),
            _ => Error::Closed,
        }
    }
}

/// Bounded FIFO with a single shutdown signal.
pub struct Backlog<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    signal: ShutdownSignal,
}

impl<T> Backlog<T> {
    /// Create a backlog with its own shutdown signal.
    pub fn new(capacity: usize) -> Self {
        Self::with_signal(capacity, ShutdownSignal::new())
    }

    /// Create a backlog that closes together with `signal`.
    pub fn with_signal(capacity: usize, signal: ShutdownSignal) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            signal,
        }
    }

    /// The shutdown signal shared by producers and consumers.
    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }

    /// Enqueue `item`, waiting while the backlog is full.
    ///
    /// Once the backlog is closed the item is handed back untouched so the
    /// producer can release whatever transport resource it holds.
    pub async fn push(&self, item: T) -> std::result::Result<(), T> {
        if self.signal.is_triggered() {
            return Err(item);
        }
        let permit = tokio::select! {
            biased;
            _ = self.signal.triggered() => None,
            permit = self.tx.reserve() => permit.ok(),
        };
        match permit {
            Some(permit) => {
                permit.send(item);
                Ok(())
            }
            None => {
                trace!("backlog closed, discarding unit");
                Err(item)
            }
        }
    }

    /// Dequeue the oldest item, waiting until one arrives or the backlog closes.
    pub async fn pop(&self) -> Result<T> {
        if self.signal.is_triggered() {
            self.drain();
            return Err(self.signal.error());
        }
        let mut rx = tokio::select! {
            biased;
            _ = self.signal.triggered() => {
                self.drain();
                return Err(self.signal.error());
            }
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = self.signal.triggered() => {
                drain_receiver(&mut rx);
                Err(self.signal.error())
            }
            item = rx.recv() => item.ok_or_else(|| self.signal.error()),
        }
    }

    /// Close the backlog and drop every queued unit. Returns `true` for the
    /// call that closed it.
    pub fn close(&self, reason: Option<Error>) -> bool {
        let first = self.signal.trigger(reason);
        self.drain();
        first
    }

    /// Drop queued units once closed. A consumer holding the receiver drains
    /// it itself when it observes the signal.
    fn drain(&self) {
        if let Ok(mut rx) = self.rx.try_lock() {
            drain_receiver(&mut rx);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.signal.is_triggered()
    }
}

fn drain_receiver<T>(rx: &mut mpsc::Receiver<T>) {
    rx.close();
    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        trace!(dropped, "backlog closed, released queued units");
    }
}
