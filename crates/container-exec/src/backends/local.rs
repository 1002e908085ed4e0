//! Local process execution backend
//!
//! Runs every unit as a process on this host. The image is ignored; the
//! entrypoint and command are executed directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::process::{Launch, ProcessTable, UnitState};
use crate::backend::{AttachOptions, Attachment, Backend, Created, RemoveOptions, UnitId, WaitRegistration};
use crate::config::UnitConfig;
use crate::error::{Error, Result};
use crate::runtime::{Spawner, default_spawner};

/// Backend running units as local processes
pub struct LocalBackend {
    table: ProcessTable,
    spawner: Arc<dyn Spawner>,
    next_id: AtomicU64,
}

impl LocalBackend {
    /// Create a backend using the default spawner
    pub fn new() -> Self {
        Self {
            table: ProcessTable::default(),
            spawner: default_spawner(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run stream forwarding and exit watching with `spawner`
    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    fn launch(config: &UnitConfig) -> Result<(Launch, Vec<String>)> {
        let mut argv = config.argv().map(str::to_owned);
        let program = argv
            .next()
            .ok_or_else(|| Error::backend("create", "no command specified"))?;

        let mut warnings = Vec::new();
        if config.tty {
            warnings.push(
                "the local backend cannot allocate a terminal; output is passed through unframed".to_string(),
            );
        }
        if let Some(user) = &config.user {
            warnings.push(format!(
                "the local backend cannot switch users; ignoring user {:?}",
                user
            ));
        }

        let launch = Launch {
            program,
            args: argv.collect(),
            env: config.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            working_dir: config.working_dir.clone(),
            tty: config.tty,
            open_stdin: config.open_stdin,
            auto_remove: config.auto_remove,
            process_group: true,
        };
        Ok((launch, warnings))
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend").finish_non_exhaustive()
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn create(&self, config: &UnitConfig, name: Option<&str>) -> Result<Created> {
        let (launch, warnings) = Self::launch(config)?;
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = UnitId::new(format!("local-{}-{}", std::process::id(), n));

        self.table.insert(id.clone(), name, launch)?;
        debug!(unit = %id, name = ?name, "unit created");
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
        match self.table.state(id)? {
            UnitState::Running { pid } => send_signal(pid, signal),
            _ => Err(Error::backend("kill", format!("unit {} is not running", id))),
        }
    }

    async fn remove(&self, id: &UnitId, options: RemoveOptions) -> Result<()> {
        if let UnitState::Running { pid } = self.table.state(id)? {
            if !options.force {
                return Err(Error::backend(
                    "remove",
                    format!("unit {} is running: stop it first or force the removal", id),
                ));
            }
            if let Err(e) = send_signal(pid, "SIGKILL") {
                warn!(unit = %id, error = %e, "failed to kill unit being removed");
            }
        }
        self.table.forget(id)?;
        debug!(unit = %id, "unit removed");
        Ok(())
    }
}

/// Parse `SIGKILL`, `KILL` or `9`
#[cfg(unix)]
fn parse_signal(name: &str) -> Result<nix::sys::signal::Signal> {
    use nix::sys::signal::Signal;
    use std::str::FromStr;

    let invalid = || Error::backend("kill", format!("invalid signal: {}", name));
    if let Ok(number) = name.parse::<i32>() {
        return Signal::try_from(number).map_err(|_| invalid());
    }
    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&full).map_err(|_| invalid())
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: &str) -> Result<()> {
    use nix::sys::signal;
    use nix::unistd::Pid;

    let signal = parse_signal(signal)?;
    let pid = i32::try_from(pid).map_err(|_| Error::backend("kill", format!("pid {} out of range", pid)))?;
    // Each unit leads its own process group.
    signal::killpg(Pid::from_raw(pid), signal).map_err(|e| Error::backend("kill", e.to_string()))
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: &str) -> Result<()> {
    Err(Error::backend("kill", "signals are not supported on this platform"))
}
