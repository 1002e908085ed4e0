//! Runtime-agnostic task spawning
//!
//! Commands spawn their stream pumps and cancellation watcher through a
//! [`Spawner`], so the crate does not tie callers to one async runtime.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

/// A spawner that can run futures in the background
pub trait Spawner: Send + Sync {
    /// Spawn a future on the runtime
    ///
    /// The future will run to completion in the background.
    fn spawn(&self, future: BoxFuture<'static, ()>);
}

/// Spawner for the Smol runtime
#[cfg(feature = "smol")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SmolSpawner;

#[cfg(feature = "smol")]
impl Spawner for SmolSpawner {
    fn spawn(&self, future: BoxFuture<'static, ()>) {
        smol::spawn(future).detach();
    }
}

/// Spawner for the Tokio runtime
///
/// Must be used from within a Tokio runtime.
#[cfg(feature = "tokio")]
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

#[cfg(feature = "tokio")]
impl Spawner for TokioSpawner {
    fn spawn(&self, future: BoxFuture<'static, ()>) {
        tokio::spawn(future);
    }
}

/// Spawner that drives each future on its own OS thread
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSpawner;

impl Spawner for ThreadSpawner {
    fn spawn(&self, future: BoxFuture<'static, ()>) {
        let spawned = std::thread::Builder::new()
            .name("container-exec".into())
            .spawn(move || futures::executor::block_on(future));
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn background thread");
        }
    }
}

/// The spawner used when none is configured
///
/// Smol's global executor when the `smol` feature is enabled, one thread per
/// task otherwise.
pub fn default_spawner() -> Arc<dyn Spawner> {
    #[cfg(feature = "smol")]
    {
        Arc::new(SmolSpawner)
    }

    #[cfg(not(feature = "smol"))]
    {
        Arc::new(ThreadSpawner)
    }
}

/// Sleep for the specified duration on any runtime
pub async fn sleep(duration: Duration) {
    async_io::Timer::after(duration).await;
}
