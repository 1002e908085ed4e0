//! Run commands inside containers the way `std::process::Command` runs them
//! locally
//!
//! A [`Cmd`] describes one program to run in a unit managed by a
//! [`Backend`] (a container engine, or plain host processes with
//! [`LocalBackend`]). Bind standard streams, then `run`, or `start` and
//! `wait`. `output` and `combined_output` collect what the unit writes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use container_exec::{Cmd, LocalBackend};
//!
//! # smol::block_on(async {
//! let backend = Arc::new(LocalBackend::new());
//! let mut cmd = Cmd::new(backend, "ubuntu:focal", "sh", ["-c", "echo Hello, World!"]);
//! let output = cmd.output().await?;
//! assert_eq!(output, b"Hello, World!\n");
//! # Ok::<(), container_exec::Error>(())
//! # });
//! ```
//!
//! The crate is runtime agnostic: background copying is spawned through a
//! [`Spawner`], smol's executor by default.

#![warn(missing_docs)]

pub mod backend;
pub mod backends;
pub mod capture;
pub mod close;
pub mod cmd;
pub mod config;
pub mod context;
pub mod demux;
pub mod error;
pub mod pipe;
mod pump;
pub mod runtime;
pub mod stream;

pub use backend::{
    AttachOptions, Attachment, Backend, Created, RemoveOptions, UnitId, WaitNotifier, WaitRegistration,
    WaitResponse,
};
pub use backends::LocalBackend;
#[cfg(feature = "docker")]
pub use backends::DockerCliBackend;
pub use capture::{DEFAULT_CAPTURE_SIZE, PrefixSuffixSaver};
pub use close::{Close, CloseOnce};
pub use cmd::{Cmd, StdinPipe};
pub use config::UnitConfig;
pub use context::{Context, ContextError};
pub use demux::{Demultiplexer, StdCopy, StreamType};
pub use error::{Error, ExitError, Result};
pub use pipe::{PipeCloser, PipeReader, PipeWriter, pipe};
pub use runtime::{Spawner, ThreadSpawner, default_spawner};
pub use stream::SharedBuffer;
