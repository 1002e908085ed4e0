//! Stream types used for stdin, stdout and stderr bindings

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::io::{AsyncRead, AsyncWrite};

/// An owned input stream
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// An owned output stream
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A sink that drops everything written to it
pub(crate) fn discard() -> BoxWriter {
    Box::new(futures::io::sink())
}

/// A cloneable in-memory sink.
///
/// All clones append to the same buffer, in the order writes arrive.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the bytes written so far
    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Take the bytes written so far, leaving the buffer empty
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
