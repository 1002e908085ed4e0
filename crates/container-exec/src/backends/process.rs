//! Units backed by a host process
//!
//! Both bundled backends run every unit through one attached child process:
//! the program itself for [`LocalBackend`](super::LocalBackend), the
//! `docker start --attach` client for the Docker backend. This module keeps
//! the table of those units and moves bytes between the child's standard
//! streams and the in-process pipes handed out by `attach`.

use std::collections::HashMap;
use std::io;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_process::{Child, ChildStdin, Stdio};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use futures::lock::Mutex as AsyncMutex;
use tracing::debug;

use crate::backend::{AttachOptions, Attachment, UnitId, WaitNotifier, WaitRegistration, WaitResponse};
use crate::demux::{FRAME_HEADER_LEN, StreamType, encode_frame};
use crate::error::{Error, Result};
use crate::pipe::{PipeReader, PipeWriter, pipe};
use crate::runtime::Spawner;
use crate::stream::BoxWriter;

const COPY_BUFFER_SIZE: usize = 32 << 10;

/// How to run a unit's process
#[derive(Debug, Clone, Default)]
pub(crate) struct Launch {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) working_dir: Option<String>,
    /// Pass output through unframed, stdout and stderr merged
    pub(crate) tty: bool,
    /// Give the process a stdin
    pub(crate) open_stdin: bool,
    /// Forget the unit once it exits
    pub(crate) auto_remove: bool,
    /// Lead a new process group so signals reach the process's children too
    pub(crate) process_group: bool,
}

/// Unit-side pipe ends waiting for `start`
#[derive(Default)]
struct PendingIo {
    stdin: Option<PipeReader>,
    output: Option<PipeWriter>,
    stdout: bool,
    stderr: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UnitState {
    Created,
    Running { pid: u32 },
    Exited(WaitResponse),
}

struct Unit {
    name: Option<String>,
    launch: Launch,
    io: PendingIo,
    state: UnitState,
    waiters: Vec<WaitNotifier>,
}

/// Shared table of process-backed units
#[derive(Clone, Default)]
pub(crate) struct ProcessTable {
    units: Arc<Mutex<HashMap<UnitId, Unit>>>,
}

impl ProcessTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<UnitId, Unit>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a new unit
    pub(crate) fn insert(&self, id: UnitId, name: Option<&str>, launch: Launch) -> Result<()> {
        let mut units = self.lock();
        if let Some(name) = name {
            if units.values().any(|u| u.name.as_deref() == Some(name)) {
                return Err(Error::backend(
                    "create",
                    format!("the name {:?} is already in use", name),
                ));
            }
        }
        units.insert(
            id,
            Unit {
                name: name.map(str::to_owned),
                launch,
                io: PendingIo::default(),
                state: UnitState::Created,
                waiters: Vec::new(),
            },
        );
        Ok(())
    }

    /// The unit's current state
    pub(crate) fn state(&self, id: &UnitId) -> Result<UnitState> {
        self.lock()
            .get(id)
            .map(|u| u.state.clone())
            .ok_or_else(|| not_found(id))
    }

    /// Drop the unit's record
    pub(crate) fn forget(&self, id: &UnitId) -> Result<()> {
        self.lock().remove(id).map(|_| ()).ok_or_else(|| not_found(id))
    }

    /// Hand out the caller's ends of the unit's streams
    pub(crate) fn attach(&self, id: &UnitId, options: AttachOptions) -> Result<Attachment> {
        let mut units = self.lock();
        let unit = units.get_mut(id).ok_or_else(|| not_found(id))?;
        if unit.state != UnitState::Created {
            return Err(Error::backend("attach", format!("unit {} is already started", id)));
        }

        let input: Option<BoxWriter> = options.stdin.then(|| {
            let (reader, writer) = pipe();
            unit.io.stdin = Some(reader);
            Box::new(writer) as BoxWriter
        });

        let (output, writer) = pipe();
        if options.stdout || options.stderr {
            unit.io.output = Some(writer);
            unit.io.stdout = options.stdout;
            unit.io.stderr = options.stderr;
        }

        Ok(Attachment {
            input,
            output: Box::new(output),
        })
    }

    /// Register for the unit's exit
    pub(crate) fn wait(&self, id: &UnitId) -> WaitRegistration {
        let mut units = self.lock();
        let Some(unit) = units.get_mut(id) else {
            return WaitRegistration::failed(not_found(id));
        };
        let (notifier, registration) = WaitRegistration::channel();
        match &unit.state {
            UnitState::Exited(response) => notifier.exited(response.clone()),
            _ => unit.waiters.push(notifier),
        }
        registration
    }

    /// Spawn the unit's process and its stream forwarders
    pub(crate) fn start(&self, id: &UnitId, spawner: &dyn Spawner) -> Result<u32> {
        let (launch, io) = {
            let mut units = self.lock();
            let unit = units.get_mut(id).ok_or_else(|| not_found(id))?;
            if unit.state != UnitState::Created {
                return Err(Error::backend("start", format!("unit {} is already started", id)));
            }
            (unit.launch.clone(), std::mem::take(&mut unit.io))
        };

        let stdin_piped = io.stdin.is_some() && launch.open_stdin;
        // A terminal merges both streams into whatever is attached.
        let stdout_piped = io.stdout || (launch.tty && io.stderr);
        let stderr_piped = io.stderr || (launch.tty && io.stdout);

        let mut command = new_command(&launch);
        command
            .args(&launch.args)
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if stdin_piped { Stdio::piped() } else { Stdio::null() })
            .stdout(if stdout_piped { Stdio::piped() } else { Stdio::null() })
            .stderr(if stderr_piped { Stdio::piped() } else { Stdio::null() });
        if let Some(dir) = &launch.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::backend("start", format!("failed to spawn {}: {}", launch.program, e)))?;
        let pid = child.id();
        debug!(unit = %id, pid, program = %launch.program, "process spawned");

        if let (Some(reader), Some(child_stdin)) = (io.stdin, child.stdin.take()) {
            let unit = id.clone();
            spawner.spawn(Box::pin(async move {
                forward_input(unit, reader, child_stdin).await;
            }));
        }

        if let Some(writer) = io.output {
            let sink = Arc::new(AsyncMutex::new(writer));
            if let Some(out) = child.stdout.take() {
                spawner.spawn(Box::pin(forward_output(out, StreamType::Stdout, sink.clone(), launch.tty)));
            }
            if let Some(err) = child.stderr.take() {
                spawner.spawn(Box::pin(forward_output(err, StreamType::Stderr, sink, launch.tty)));
            }
        }

        if let Some(unit) = self.lock().get_mut(id) {
            unit.state = UnitState::Running { pid };
        }

        let table = self.clone();
        let unit = id.clone();
        spawner.spawn(Box::pin(async move {
            table.reap(unit, child).await;
        }));

        Ok(pid)
    }

    /// Wait for the child and notify every registered waiter
    async fn reap(&self, id: UnitId, mut child: Child) {
        let response = match child.status().await {
            Ok(status) => WaitResponse::exited(exit_code(status)),
            Err(e) => WaitResponse {
                status_code: -1,
                error: Some(format!("waiting for process: {}", e)),
            },
        };
        debug!(unit = %id, status = response.status_code, "process exited");

        let waiters = {
            let mut units = self.lock();
            let Some(unit) = units.get_mut(&id) else {
                return;
            };
            let waiters = std::mem::take(&mut unit.waiters);
            if unit.launch.auto_remove {
                units.remove(&id);
            } else {
                unit.state = UnitState::Exited(response.clone());
            }
            waiters
        };
        for waiter in waiters {
            waiter.exited(response.clone());
        }
    }
}

#[cfg(unix)]
fn new_command(launch: &Launch) -> async_process::Command {
    use std::os::unix::process::CommandExt;

    let mut command = std::process::Command::new(&launch.program);
    if launch.process_group {
        command.process_group(0);
    }
    command.into()
}

#[cfg(not(unix))]
fn new_command(launch: &Launch) -> async_process::Command {
    async_process::Command::new(&launch.program)
}

fn not_found(id: &UnitId) -> Error {
    Error::UnitNotFound { id: id.to_string() }
}

/// Exit status as reported by container engines: signals map to 128 + n
pub(crate) fn exit_code(status: ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return i64::from(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + i64::from(signal);
        }
    }
    -1
}

async fn forward_input(id: UnitId, mut reader: PipeReader, mut child_stdin: ChildStdin) {
    let copied = futures::io::copy(&mut reader, &mut child_stdin).await;
    if let Err(e) = child_stdin.close().await {
        debug!(unit = %id, error = %e, "closing process stdin");
    }
    debug!(unit = %id, ?copied, "stdin forwarding finished");
}

async fn forward_output<R>(mut src: R, stream: StreamType, sink: Arc<AsyncMutex<PipeWriter>>, raw: bool)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut frame = Vec::with_capacity(COPY_BUFFER_SIZE + FRAME_HEADER_LEN);
    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(?stream, error = %e, "reading process output");
                break;
            }
        };
        let chunk = if raw {
            &buf[..n]
        } else {
            frame.clear();
            encode_frame(stream, &buf[..n], &mut frame);
            &frame[..]
        };
        if let Err(e) = sink.lock().await.write_all(chunk).await {
            debug!(?stream, error = %e, "output reader went away");
            break;
        }
    }
}
