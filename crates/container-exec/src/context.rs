//! Cancellation for running units
//!
//! A [`Context`] is handed to [`Cmd::with_context`](crate::Cmd::with_context).
//! Once it is done, the command kills its unit and `wait` reports the
//! context's error, which callers can tell apart from every other failure.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use thiserror::Error;

use crate::runtime::{self, Spawner};

/// Why a context is done
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// The context was cancelled explicitly
    #[error("context canceled")]
    Canceled,

    /// The context's deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

struct Inner {
    reason: OnceLock<ContextError>,
    // Closed when the context is done; nothing is ever sent.
    tx: Sender<()>,
    rx: Receiver<()>,
}

/// A cloneable cancellation signal.
///
/// All clones observe the same state. Cancelling is idempotent and the first
/// reason wins.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Create a context that is done only once cancelled
    pub fn new() -> Self {
        let (tx, rx) = async_channel::bounded(1);
        Self {
            inner: Arc::new(Inner {
                reason: OnceLock::new(),
                tx,
                rx,
            }),
        }
    }

    /// Create a context that is cancelled with
    /// [`ContextError::DeadlineExceeded`] after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_timeout_on(timeout, &*runtime::default_spawner())
    }

    /// Like [`with_timeout`](Self::with_timeout) with an explicit spawner for
    /// the deadline timer
    pub fn with_timeout_on(timeout: Duration, spawner: &dyn Spawner) -> Self {
        let ctx = Self::new();
        let timer = ctx.clone();
        spawner.spawn(Box::pin(async move {
            let deadline = runtime::sleep(timeout);
            let done = timer.done();
            futures::pin_mut!(deadline, done);
            if let futures::future::Either::Left(_) = futures::future::select(deadline, done).await {
                timer.finish(ContextError::DeadlineExceeded);
            }
        }));
        ctx
    }

    /// Cancel the context
    pub fn cancel(&self) {
        self.finish(ContextError::Canceled);
    }

    fn finish(&self, reason: ContextError) {
        if self.inner.reason.set(reason).is_ok() {
            tracing::debug!(%reason, "context done");
            self.inner.tx.close();
        }
    }

    /// Whether the context is done
    pub fn is_done(&self) -> bool {
        self.inner.reason.get().is_some()
    }

    /// Why the context is done, if it is
    pub fn err(&self) -> Option<ContextError> {
        self.inner.reason.get().copied()
    }

    /// Resolves once the context is done
    pub async fn done(&self) {
        // recv only fails once the channel is closed, which is what we wait for
        let _ = self.inner.rx.recv().await;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("err", &self.err()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_idempotent() {
        let ctx = Context::new();
        assert!(!ctx.is_done());
        assert_eq!(ctx.err(), None);

        ctx.cancel();
        ctx.cancel();
        assert!(ctx.is_done());
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
    }

    #[smol_potat::test]
    async fn test_done_resolves_for_clones() {
        let ctx = Context::new();
        let clone = ctx.clone();

        let waiter = smol::spawn(async move {
            clone.done().await;
            clone.err()
        });

        ctx.cancel();
        assert_eq!(waiter.await, Some(ContextError::Canceled));
    }

    #[smol_potat::test]
    async fn test_timeout_sets_deadline_exceeded() {
        let ctx = Context::with_timeout(Duration::from_millis(20));
        ctx.done().await;
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[smol_potat::test]
    async fn test_cancel_before_deadline_wins() {
        let ctx = Context::with_timeout(Duration::from_millis(50));
        ctx.cancel();
        runtime::sleep(Duration::from_millis(80)).await;
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
    }
}
