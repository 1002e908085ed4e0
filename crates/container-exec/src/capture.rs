//! Bounded capture of diagnostic output

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::io::AsyncWrite;

/// Default prefix and suffix size used by [`Cmd::output`](crate::Cmd::output)
pub const DEFAULT_CAPTURE_SIZE: usize = 32 << 10;

/// A writer which retains the first `n` and the last `n` bytes written to it.
///
/// [`bytes`](Self::bytes) reconstructs the retained output with a note about
/// how many bytes were dropped in between.
#[derive(Debug, Clone)]
pub struct PrefixSuffixSaver {
    n: usize,
    prefix: Vec<u8>,
    // Ring buffer once `suffix.len() == n`
    suffix: Vec<u8>,
    suffix_off: usize,
    skipped: u64,
}

impl PrefixSuffixSaver {
    /// Create a saver keeping at most `n` bytes of prefix and `n` bytes of suffix
    pub fn new(n: usize) -> Self {
        Self {
            n,
            prefix: Vec::new(),
            suffix: Vec::new(),
            suffix_off: 0,
            skipped: 0,
        }
    }

    /// Number of bytes that were written but are not retained
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Record `p`. Always consumes all of it.
    pub fn write_bytes(&mut self, p: &[u8]) -> usize {
        let len = p.len();
        let p = fill(self.n, &mut self.prefix, p);

        // Only keep the last n bytes of suffix data.
        let p = match p.len().checked_sub(self.n) {
            Some(overage) if overage > 0 => {
                self.skipped += overage as u64;
                &p[overage..]
            }
            _ => p,
        };
        let mut p = fill(self.n, &mut self.suffix, p);

        // The suffix is full if anything is left. Overwrite it in a circle.
        while !p.is_empty() {
            let room = self.n - self.suffix_off;
            let take = room.min(p.len());
            self.suffix[self.suffix_off..self.suffix_off + take].copy_from_slice(&p[..take]);
            p = &p[take..];
            self.skipped += take as u64;
            self.suffix_off += take;
            if self.suffix_off == self.n {
                self.suffix_off = 0;
            }
        }
        len
    }

    /// Reconstruct the retained output
    pub fn bytes(&self) -> Vec<u8> {
        if self.suffix.is_empty() {
            return self.prefix.clone();
        }
        if self.skipped == 0 {
            let mut out = self.prefix.clone();
            out.extend_from_slice(&self.suffix);
            return out;
        }
        let marker = format!("\n... omitting {} bytes ...\n", self.skipped);
        let mut out = Vec::with_capacity(self.prefix.len() + marker.len() + self.suffix.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(marker.as_bytes());
        out.extend_from_slice(&self.suffix[self.suffix_off..]);
        out.extend_from_slice(&self.suffix[..self.suffix_off]);
        out
    }
}

/// Append up to `p.len()` bytes of `p` to `dst` so `dst` does not grow past
/// `n`. Returns what did not fit.
fn fill<'a>(n: usize, dst: &mut Vec<u8>, p: &'a [u8]) -> &'a [u8] {
    let remain = n.saturating_sub(dst.len());
    let add = remain.min(p.len());
    dst.extend_from_slice(&p[..add]);
    &p[add..]
}

impl io::Write for PrefixSuffixSaver {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_bytes(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A cloneable async sink feeding a shared [`PrefixSuffixSaver`]
#[derive(Debug, Clone)]
pub struct SharedCapture {
    inner: Arc<Mutex<PrefixSuffixSaver>>,
}

impl SharedCapture {
    /// Create a shared capture retaining `n` bytes of prefix and suffix
    pub fn new(n: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PrefixSuffixSaver::new(n))),
        }
    }

    /// Reconstruct what has been captured so far
    pub fn bytes(&self) -> Vec<u8> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bytes()
    }
}

impl AsyncWrite for SharedCapture {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let written = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_bytes(buf);
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
