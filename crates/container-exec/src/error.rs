//! Error types for running commands in a backend

use std::fmt;

use thiserror::Error;

use crate::context::ContextError;

/// Unified error type for command execution
#[derive(Error, Debug)]
pub enum Error {
    /// `start` was called on a command that has already been started
    #[error("container-exec: already started")]
    AlreadyStarted,

    /// `wait` was called before `start`
    #[error("container-exec: not started")]
    NotStarted,

    /// `wait` was called more than once
    #[error("container-exec: wait was already called")]
    AlreadyWaited,

    /// A terminal was requested together with a separate stderr sink
    #[error("container-exec: can't set both tty and stderr")]
    TtyWithStderr,

    /// Stdin is already bound
    #[error("container-exec: stdin already set")]
    StdinAlreadySet,

    /// Stdout is already bound
    #[error("container-exec: stdout already set")]
    StdoutAlreadySet,

    /// Stderr is already bound
    #[error("container-exec: stderr already set")]
    StderrAlreadySet,

    /// A pipe accessor was used after the unit started
    #[error("container-exec: {stream} pipe after unit started")]
    PipeAfterStart {
        /// The stream the pipe was requested for
        stream: &'static str,
    },

    /// The unit ran but exited with a non-zero status
    #[error(transparent)]
    Exit(#[from] ExitError),

    /// The backend reported an error for the unit while waiting on it
    #[error("{message}")]
    Unit {
        /// The message reported by the backend
        message: String,
    },

    /// The command's context was cancelled or its deadline passed
    #[error(transparent)]
    Context(#[from] ContextError),

    /// A backend operation failed
    #[error("{operation} failed: {reason}")]
    Backend {
        /// The backend operation that failed (`create`, `attach`, ...)
        operation: &'static str,
        /// The detailed reason reported by the backend
        reason: String,
    },

    /// The backend does not know the unit
    #[error("no such unit: {id}")]
    UnitNotFound {
        /// The unit ID that was not found
        id: String,
    },

    /// I/O error while copying to or from the unit
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a backend operation error
    pub fn backend(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Backend {
            operation,
            reason: reason.into(),
        }
    }

    /// Returns true if this error was caused by cancelling the command's context
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Context(_))
    }

    /// The exit error, if the unit ran and exited non-zero
    pub fn exit_status(&self) -> Option<&ExitError> {
        match self {
            Error::Exit(exit) => Some(exit),
            _ => None,
        }
    }
}

/// An unsuccessful exit by a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitError {
    /// The unit's exit status
    pub status_code: i64,

    /// A subset of the standard error output, populated by
    /// [`Cmd::output`](crate::Cmd::output) when stderr was not otherwise
    /// being collected.
    ///
    /// If the error output is long, this may contain only a prefix and
    /// suffix of the output, with the middle replaced by a note about the
    /// number of omitted bytes. It is meant for error messages; callers with
    /// other needs should bind their own stderr sink.
    pub stderr: Vec<u8>,

    /// Whatever was collected on stdout (or the combined stream) by
    /// [`Cmd::output`](crate::Cmd::output) and
    /// [`Cmd::combined_output`](crate::Cmd::combined_output) before the unit
    /// exited.
    pub output: Vec<u8>,
}

impl ExitError {
    /// Create an exit error for the given status
    pub fn new(status_code: i64) -> Self {
        Self {
            status_code,
            ..Self::default()
        }
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit status {}", self.status_code)
    }
}

impl std::error::Error for ExitError {}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
