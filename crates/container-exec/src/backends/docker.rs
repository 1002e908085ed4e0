//! Docker backend driving the `docker` CLI
//!
//! Units are containers. `create` runs `docker create`; the attached I/O goes
//! through a `docker start --attach` client whose exit status is the
//! container's. The client demultiplexes the container's output onto its own
//! stdout and stderr, which are re-framed for the command.

use std::sync::Arc;

use async_process::Stdio;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::process::{Launch, ProcessTable};
use crate::backend::{AttachOptions, Attachment, Backend, Created, RemoveOptions, UnitId, WaitRegistration};
use crate::config::UnitConfig;
use crate::error::{Error, Result};
use crate::runtime::{Spawner, default_spawner};

/// Backend running units as Docker containers through the `docker` CLI
pub struct DockerCliBackend {
    program: String,
    table: ProcessTable,
    spawner: Arc<dyn Spawner>,
}

impl DockerCliBackend {
    /// Use the `docker` binary found on `PATH`
    pub fn new() -> Self {
        Self::with_program("docker")
    }

    /// Use a specific docker-compatible CLI, such as `podman`
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            table: ProcessTable::default(),
            spawner: default_spawner(),
        }
    }

    /// Run stream forwarding and exit watching with `spawner`
    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Run a one-shot CLI command, returning its stdout and stderr
    async fn docker(&self, operation: &'static str, args: &[String]) -> Result<(String, String)> {
        debug!(program = %self.program, ?args, "running docker command");
        let output = async_process::Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::backend(operation, format!("failed to run {}: {}", self.program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            let message = stderr.trim();
            let message = message.strip_prefix("Error response from daemon: ").unwrap_or(message);
            if message.starts_with("No such container") {
                return Err(Error::UnitNotFound {
                    id: args.last().cloned().unwrap_or_default(),
                });
            }
            return Err(Error::backend(operation, message));
        }
        Ok((stdout, stderr))
    }
}

impl Default for DockerCliBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DockerCliBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerCliBackend")
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

/// Arguments for `docker create`
fn create_args(config: &UnitConfig, name: Option<&str>) -> Vec<String> {
    let mut args = vec!["create".to_string()];

    if let Some(name) = name {
        args.extend(["--name".into(), name.into()]);
    }
    for (key, value) in &config.env {
        args.extend(["--env".into(), format!("{}={}", key, value)]);
    }
    for (key, value) in &config.labels {
        args.extend(["--label".into(), format!("{}={}", key, value)]);
    }
    if let Some(dir) = &config.working_dir {
        args.extend(["--workdir".into(), dir.clone()]);
    }
    if let Some(user) = &config.user {
        args.extend(["--user".into(), user.clone()]);
    }
    if config.tty {
        args.push("--tty".into());
    }
    if config.open_stdin {
        args.push("--interactive".into());
    }
    if config.auto_remove {
        args.push("--rm".into());
    }

    // The CLI takes one entrypoint word; the rest lead the command.
    let mut entrypoint = config.entrypoint.iter();
    if let Some(first) = entrypoint.next() {
        args.extend(["--entrypoint".into(), first.clone()]);
    }

    args.push(config.image.clone());
    args.extend(entrypoint.cloned());
    args.extend(config.cmd.iter().cloned());
    args
}

/// Split `docker create` output into the container ID and warnings
fn parse_created(stdout: &str, stderr: &str) -> Option<(UnitId, Vec<String>)> {
    let id = stdout.lines().map(str::trim).rfind(|l| !l.is_empty())?;
    let warnings = stderr
        .lines()
        .filter_map(|line| line.trim().strip_prefix("WARNING:"))
        .map(|w| w.trim().to_string())
        .collect();
    Some((UnitId::new(id), warnings))
}

#[async_trait]
impl Backend for DockerCliBackend {
    async fn create(&self, config: &UnitConfig, name: Option<&str>) -> Result<Created> {
        if config.image.is_empty() {
            return Err(Error::backend("create", "no image specified"));
        }
        let (stdout, stderr) = self.docker("create", &create_args(config, name)).await?;
        let (id, warnings) = parse_created(&stdout, &stderr)
            .ok_or_else(|| Error::backend("create", "docker did not report a container ID"))?;

        let mut args = vec!["start".to_string(), "--attach".to_string()];
        if config.open_stdin {
            args.push("--interactive".into());
        }
        args.push(id.to_string());
        let client = Launch {
            program: self.program.clone(),
            args,
            tty: config.tty,
            open_stdin: config.open_stdin,
            // The container record lives in Docker; only the client is tracked.
            auto_remove: true,
            ..Launch::default()
        };
        self.table.insert(id.clone(), None, client)?;

        debug!(unit = %id, image = %config.image, "container created");
        Ok(Created { id, warnings })
    }

    async fn attach(&self, id: &UnitId, options: AttachOptions) -> Result<Attachment> {
        self.table.attach(id, options)
    }

    async fn start(&self, id: &UnitId) -> Result<()> {
        self.table.start(id, &*self.spawner).map(|_| ())
    }

    fn wait(&self, id: &UnitId) -> WaitRegistration {
        self.table.wait(id)
    }

    async fn kill(&self, id: &UnitId, signal: &str) -> Result<()> {
        let args = ["kill".to_string(), "--signal".to_string(), signal.to_string(), id.to_string()];
        self.docker("kill", &args).await.map(|_| ())
    }

    async fn remove(&self, id: &UnitId, options: RemoveOptions) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if options.force {
            args.push("--force".into());
        }
        if options.remove_volumes {
            args.push("--volumes".into());
        }
        args.push(id.to_string());

        let removed = self.docker("remove", &args).await;
        if self.table.forget(id).is_err() {
            debug!(unit = %id, "no attached client to forget");
        }
        if let Err(e) = &removed {
            warn!(unit = %id, error = %e, "container removal failed");
        }
        removed.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_args() {
        let mut config = UnitConfig::new("ubuntu:focal", "-c", ["echo $A"])
            .entrypoint(["/bin/sh", "-e"])
            .env("A", "1")
            .working_dir("/tmp")
            .tty(true);
        config.open_stdin = true;

        let args = create_args(&config, Some("job"));
        assert_eq!(
            args,
            vec![
                "create", "--name", "job", "--env", "A=1", "--workdir", "/tmp", "--tty", "--interactive",
                "--rm", "--entrypoint", "/bin/sh", "ubuntu:focal", "-e", "-c", "echo $A",
            ]
        );
    }

    #[test]
    fn test_parse_created() {
        let stdout = "3f4e8a\n";
        let stderr = "WARNING: The requested image's platform does not match\n";
        let (id, warnings) = parse_created(stdout, stderr).unwrap();
        assert_eq!(id.as_str(), "3f4e8a");
        assert_eq!(warnings, vec!["The requested image's platform does not match"]);

        assert!(parse_created("\n", "").is_none());
    }
}
