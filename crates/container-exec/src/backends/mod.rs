//! Bundled backends
//!
//! [`LocalBackend`] runs units as host processes and needs nothing else
//! installed. With the `docker` feature, [`DockerCliBackend`] runs them as
//! containers through the `docker` CLI. Other engines plug in by
//! implementing [`Backend`](crate::Backend).

mod process;

pub mod local;
pub use local::LocalBackend;

#[cfg(feature = "docker")]
pub mod docker;
#[cfg(feature = "docker")]
pub use docker::DockerCliBackend;
