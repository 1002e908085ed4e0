//! Common test utilities

#![allow(dead_code)]

pub mod scripted;

use std::sync::Arc;
use std::time::Duration;

use container_exec::{Backend, LocalBackend};

/// A fresh local backend
pub fn local() -> Arc<dyn Backend> {
    Arc::new(LocalBackend::new())
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        smol::Timer::after(Duration::from_millis(10)).await;
    }
    check()
}

/// Check whether a Docker daemon is reachable through the CLI
pub fn is_docker_available() -> bool {
    std::process::Command::new("docker")
        .args(["info", "--format", "{{.ServerVersion}}"])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Helper message when Docker is not available
pub fn docker_not_available_message() {
    eprintln!("Docker daemon not reachable, skipping.");
    eprintln!("Start Docker and make sure `docker info` succeeds.");
}
