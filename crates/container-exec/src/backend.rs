//! Backend trait for execution engines
//!
//! A backend owns units (containers, processes, ...) and exposes the
//! capability set a [`Cmd`](crate::Cmd) needs: create, attach, start, wait,
//! kill and remove. Any engine implementing [`Backend`] can run commands.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::UnitConfig;
use crate::demux::{Demultiplexer, StdCopy};
use crate::error::{Error, Result};
use crate::stream::{BoxReader, BoxWriter};

/// Opaque identifier assigned to a unit by its backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(String);

impl UnitId {
    /// Wrap a backend-assigned identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of creating a unit
#[derive(Debug, Clone)]
pub struct Created {
    /// The new unit's identifier
    pub id: UnitId,
    /// Non-fatal warnings reported while creating the unit
    pub warnings: Vec<String>,
}

/// Which streams to attach to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachOptions {
    /// Attach the unit's stdin
    pub stdin: bool,
    /// Attach the unit's stdout
    pub stdout: bool,
    /// Attach the unit's stderr
    pub stderr: bool,
}

/// A connection to a unit's standard streams
pub struct Attachment {
    /// Write half feeding the unit's stdin. Present iff stdin was requested.
    ///
    /// Closing it half-closes the connection: the unit sees EOF on stdin.
    pub input: Option<BoxWriter>,
    /// Read half carrying the unit's output. Raw in terminal mode, framed per
    /// the backend's [`Demultiplexer`] otherwise. Immediately at EOF when no
    /// output stream was requested.
    pub output: BoxReader,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("input", &self.input.is_some())
            .finish_non_exhaustive()
    }
}

/// Exit notification for a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitResponse {
    /// The unit's exit status
    pub status_code: i64,
    /// An error the backend hit while waiting on the unit
    pub error: Option<String>,
}

impl WaitResponse {
    /// A clean exit with the given status
    pub fn exited(status_code: i64) -> Self {
        Self {
            status_code,
            error: None,
        }
    }
}

/// Pending exit notification returned by [`Backend::wait`].
///
/// Exactly one of the two channels yields a value.
#[derive(Debug)]
pub struct WaitRegistration {
    /// Fires once when the unit exits
    pub status: async_channel::Receiver<WaitResponse>,
    /// Fires once if waiting on the unit failed
    pub error: async_channel::Receiver<Error>,
}

impl WaitRegistration {
    /// A registration and the senders that complete it
    pub fn channel() -> (WaitNotifier, WaitRegistration) {
        let (status_tx, status_rx) = async_channel::bounded(1);
        let (error_tx, error_rx) = async_channel::bounded(1);
        (
            WaitNotifier {
                status: status_tx,
                error: error_tx,
            },
            WaitRegistration {
                status: status_rx,
                error: error_rx,
            },
        )
    }

    /// A registration that has already failed
    pub fn failed(err: Error) -> Self {
        let (notifier, registration) = Self::channel();
        notifier.fail(err);
        registration
    }

    /// Wait for whichever channel fires first
    pub async fn recv(&self) -> Result<WaitResponse> {
        use futures::future::{Either, select};

        let status = self.status.recv();
        let error = self.error.recv();
        futures::pin_mut!(status, error);
        match select(status, error).await {
            Either::Left((Ok(response), _)) => Ok(response),
            Either::Right((Ok(err), _)) => Err(err),
            // One side hung up without a value; the other one decides.
            Either::Left((Err(_), error)) => match error.await {
                Ok(err) => Err(err),
                Err(_) => Err(Error::backend("wait", "exit notification dropped")),
            },
            Either::Right((Err(_), status)) => status
                .await
                .map_err(|_| Error::backend("wait", "exit notification dropped")),
        }
    }
}

/// Sending side of a [`WaitRegistration`]
#[derive(Debug, Clone)]
pub struct WaitNotifier {
    status: async_channel::Sender<WaitResponse>,
    error: async_channel::Sender<Error>,
}

impl WaitNotifier {
    /// Report the unit's exit
    pub fn exited(&self, response: WaitResponse) {
        let _ = self.status.try_send(response);
        self.error.close();
    }

    /// Report that waiting failed
    pub fn fail(&self, err: Error) {
        let _ = self.error.try_send(err);
        self.status.close();
    }
}

/// Options for removing a unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Kill the unit first if it is running
    pub force: bool,
    /// Remove anonymous volumes attached to the unit
    pub remove_volumes: bool,
}

/// An execution engine that can run units
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Create a unit from `config`, optionally naming it
    async fn create(&self, config: &UnitConfig, name: Option<&str>) -> Result<Created>;

    /// Attach to the unit's standard streams
    async fn attach(&self, id: &UnitId, options: AttachOptions) -> Result<Attachment>;

    /// Start the unit
    async fn start(&self, id: &UnitId) -> Result<()>;

    /// Register for the unit's next exit
    fn wait(&self, id: &UnitId) -> WaitRegistration;

    /// Send `signal` (for example `"SIGKILL"`) to the unit
    async fn kill(&self, id: &UnitId, signal: &str) -> Result<()>;

    /// Remove the unit
    async fn remove(&self, id: &UnitId, options: RemoveOptions) -> Result<()>;

    /// How this backend frames combined output when no terminal is allocated
    fn demultiplexer(&self) -> Arc<dyn Demultiplexer> {
        Arc::new(StdCopy)
    }
}
