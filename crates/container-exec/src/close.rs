//! Closable resources and the once-closer wrapper
//!
//! A [`Cmd`](crate::Cmd) collects handles that have to be closed when some
//! event happens (stdin copied, output copied, wait finished). Those handles
//! implement [`Close`]; [`CloseOnce`] makes a handle safe to close from both
//! the caller and the command.

use std::io;
use std::sync::{Arc, OnceLock};

/// A resource that can be closed through a shared reference
pub trait Close: Send + Sync {
    /// Close the resource
    fn close(&self) -> io::Result<()>;
}

impl<C: Close + ?Sized> Close for Arc<C> {
    fn close(&self) -> io::Result<()> {
        (**self).close()
    }
}

impl<C: Close + ?Sized> Close for Box<C> {
    fn close(&self) -> io::Result<()> {
        (**self).close()
    }
}

/// Close every handle in the set, ignoring errors, and empty the set
pub(crate) fn close_all(closers: &mut Vec<Box<dyn Close>>) {
    for closer in closers.drain(..) {
        if let Err(e) = closer.close() {
            tracing::debug!(error = %e, "ignoring close error");
        }
    }
}

/// Wraps a [`Close`] so only the first call reaches the inner handle.
///
/// Every call returns the outcome of the first one.
#[derive(Debug)]
pub struct CloseOnce<C> {
    inner: C,
    result: OnceLock<Result<(), (io::ErrorKind, String)>>,
}

impl<C: Close> CloseOnce<C> {
    /// Wrap a closable handle
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            result: OnceLock::new(),
        }
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.result.get().is_some()
    }
}

impl<C: Close> Close for CloseOnce<C> {
    fn close(&self) -> io::Result<()> {
        self.result
            .get_or_init(|| {
                self.inner
                    .close()
                    .map_err(|e| (e.kind(), e.to_string()))
            })
            .clone()
            .map_err(|(kind, message)| io::Error::new(kind, message))
    }
}
