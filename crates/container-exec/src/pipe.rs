//! In-process async pipes
//!
//! A pipe connects an [`AsyncWrite`] half to an [`AsyncRead`] half through a
//! bounded buffer. Either half can be closed by whoever holds a
//! [`PipeCloser`] for it, not only by its owner; that is what lets a command
//! close the caller's end of a stdout pipe once `wait` is done.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use futures::io::{AsyncRead, AsyncWrite};

use crate::close::Close;

/// Default number of bytes buffered between the two halves
pub const DEFAULT_PIPE_CAPACITY: usize = 64 << 10;

/// Create a pipe with the default capacity
pub fn pipe() -> (PipeReader, PipeWriter) {
    pipe_with_capacity(DEFAULT_PIPE_CAPACITY)
}

/// Create a pipe buffering at most `capacity` bytes (at least one)
pub fn pipe_with_capacity(capacity: usize) -> (PipeReader, PipeWriter) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buf: VecDeque::new(),
            capacity: capacity.max(1),
            reader_closed: false,
            writer_closed: false,
            read_waker: None,
            write_waker: None,
        }),
    });
    (
        PipeReader {
            shared: shared.clone(),
        },
        PipeWriter { shared },
    )
}

struct State {
    buf: VecDeque<u8>,
    capacity: usize,
    reader_closed: bool,
    writer_closed: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close_read(&self) {
        let wakers = {
            let mut state = self.lock();
            state.reader_closed = true;
            state.buf.clear();
            (state.read_waker.take(), state.write_waker.take())
        };
        wake(wakers);
    }

    fn close_write(&self) {
        let wakers = {
            let mut state = self.lock();
            state.writer_closed = true;
            (state.read_waker.take(), state.write_waker.take())
        };
        wake(wakers);
    }
}

fn wake((a, b): (Option<Waker>, Option<Waker>)) {
    if let Some(w) = a {
        w.wake();
    }
    if let Some(w) = b {
        w.wake();
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "read/write on closed pipe")
}

/// The reading half of a pipe
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// A handle that closes this half
    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            shared: self.shared.clone(),
            side: Side::Read,
        }
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let (n, waker) = {
            let mut state = self.shared.lock();
            if state.reader_closed {
                return Poll::Ready(Err(closed_pipe()));
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            if state.buf.is_empty() {
                if state.writer_closed {
                    return Poll::Ready(Ok(0));
                }
                state.read_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            let n = buf.len().min(state.buf.len());
            for (dst, src) in buf.iter_mut().zip(state.buf.drain(..n)) {
                *dst = src;
            }
            (n, state.write_waker.take())
        };
        if let Some(w) = waker {
            w.wake();
        }
        Poll::Ready(Ok(n))
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared.close_read();
    }
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeReader").finish_non_exhaustive()
    }
}

/// The writing half of a pipe
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// A handle that closes this half
    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            shared: self.shared.clone(),
            side: Side::Write,
        }
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let (n, waker) = {
            let mut state = self.shared.lock();
            if state.writer_closed || state.reader_closed {
                return Poll::Ready(Err(closed_pipe()));
            }
            if data.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let room = state.capacity.saturating_sub(state.buf.len());
            if room == 0 {
                state.write_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            let n = room.min(data.len());
            state.buf.extend(&data[..n]);
            (n, state.read_waker.take())
        };
        if let Some(w) = waker {
            w.wake();
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.close_write();
        Poll::Ready(Ok(()))
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.close_write();
    }
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Read,
    Write,
}

/// Closes one half of a pipe from outside its owner.
///
/// Closing the write half lets the reader drain what is buffered and then see
/// EOF. Closing the read half drops buffered data and makes further reads
/// and writes fail.
#[derive(Clone)]
pub struct PipeCloser {
    shared: Arc<Shared>,
    side: Side,
}

impl Close for PipeCloser {
    fn close(&self) -> io::Result<()> {
        match self.side {
            Side::Read => self.shared.close_read(),
            Side::Write => self.shared.close_write(),
        }
        Ok(())
    }
}

impl std::fmt::Debug for PipeCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeCloser").field("side", &self.side).finish()
    }
}
