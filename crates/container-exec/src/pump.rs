//! Stream pumps moving bytes between caller streams and an attached unit
//!
//! Each pump is one copy loop run on its own task. When it finishes it
//! closes the resources that were waiting on it and reports exactly one
//! result back to the command.

use std::io;
use std::sync::Arc;

use futures::io::AsyncWriteExt;
use tracing::debug;

use crate::close::{Close, close_all};
use crate::demux::Demultiplexer;
use crate::stream::{BoxReader, BoxWriter};

enum Kind {
    /// Caller input to the unit's stdin
    Input { source: BoxReader, conn: BoxWriter },
    /// Terminal output, copied as is
    Raw { conn: BoxReader, sink: BoxWriter },
    /// Framed output split into stdout and stderr
    Demux {
        conn: BoxReader,
        stdout: BoxWriter,
        stderr: BoxWriter,
        demux: Arc<dyn Demultiplexer>,
    },
}

/// A registered copy loop
pub(crate) struct Pump {
    kind: Kind,
    close_after: Vec<Box<dyn Close>>,
}

impl Pump {
    pub(crate) fn input(source: BoxReader, conn: BoxWriter) -> Self {
        Self::new(Kind::Input { source, conn })
    }

    pub(crate) fn raw(conn: BoxReader, sink: BoxWriter) -> Self {
        Self::new(Kind::Raw { conn, sink })
    }

    pub(crate) fn demux(
        conn: BoxReader,
        stdout: BoxWriter,
        stderr: BoxWriter,
        demux: Arc<dyn Demultiplexer>,
    ) -> Self {
        Self::new(Kind::Demux {
            conn,
            stdout,
            stderr,
            demux,
        })
    }

    fn new(kind: Kind) -> Self {
        Self {
            kind,
            close_after: Vec::new(),
        }
    }

    /// Whether this pump feeds the unit's stdin
    pub(crate) fn is_input(&self) -> bool {
        matches!(self.kind, Kind::Input { .. })
    }

    /// Resources to close once this pump is done copying
    pub(crate) fn close_after(&mut self, closers: Vec<Box<dyn Close>>) {
        self.close_after.extend(closers);
    }

    /// Run the copy loop to completion
    pub(crate) async fn run(self) -> io::Result<()> {
        let Pump {
            kind,
            mut close_after,
        } = self;

        let result = match kind {
            Kind::Input { source, mut conn } => {
                let copied = futures::io::copy(source, &mut conn).await;
                // Half-close so the unit sees EOF on stdin.
                let closed = conn.close().await;
                debug!(?copied, "stdin pump finished");
                copied.and(closed)
            }
            Kind::Raw { conn, mut sink } => {
                let copied = futures::io::copy(conn, &mut sink).await;
                let flushed = sink.flush().await;
                debug!(?copied, "raw output pump finished");
                copied.map(|_| ()).and(flushed)
            }
            Kind::Demux {
                mut conn,
                mut stdout,
                mut stderr,
                demux,
            } => {
                let copied = demux.demux(&mut *conn, &mut *stdout, &mut *stderr).await;
                let flushed = stdout.flush().await.and(stderr.flush().await);
                debug!(?copied, "output pump finished");
                copied.map(|_| ()).and(flushed)
            }
        };

        close_all(&mut close_after);
        result
    }
}
