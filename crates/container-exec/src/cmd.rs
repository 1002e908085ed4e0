//! The command lifecycle controller
//!
//! [`Cmd`] runs one program inside a backend unit the way
//! `std::process::Command` runs a local process: bind stdin/stdout/stderr,
//! `start`, then `wait`. Under the hood it creates, attaches and starts the
//! unit, runs a stream pump per bound stream, and folds the unit's exit, the
//! pumps and an optional cancellation [`Context`] into a single result.

use std::fmt;
use std::io;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use async_channel::{Receiver, Sender};
use futures::future::{Either, select};
use futures::io::{AsyncRead, AsyncWrite};
use futures::lock::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::backend::{AttachOptions, Attachment, Backend, RemoveOptions, UnitId, WaitRegistration, WaitResponse};
use crate::capture::{DEFAULT_CAPTURE_SIZE, SharedCapture};
use crate::close::{Close, CloseOnce, close_all};
use crate::config::UnitConfig;
use crate::context::{Context, ContextError};
use crate::demux::Demultiplexer;
use crate::error::{Error, ExitError, Result};
use crate::pipe::{PipeCloser, PipeReader, PipeWriter, pipe};
use crate::pump::Pump;
use crate::runtime::{Spawner, default_spawner};
use crate::stream::{BoxReader, BoxWriter, SharedBuffer, discard};

/// Where a [`Cmd`] is in its single-use lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unstarted,
    Started,
    Waited,
}

/// A command being prepared or run inside a backend unit.
///
/// A `Cmd` cannot be reused after calling [`run`](Self::run),
/// [`output`](Self::output) or [`combined_output`](Self::combined_output).
pub struct Cmd {
    config: UnitConfig,
    name: Option<String>,

    // Stdin is copied to the unit by a separate task; `wait` does not
    // complete until that copy stops, either at EOF or on error.
    stdin: Option<BoxReader>,
    // Absent sinks discard their stream. With `tty`, only stdout is
    // available.
    stdout: Option<BoxWriter>,
    stderr: Option<BoxWriter>,

    id: Option<UnitId>,
    warnings: Vec<String>,
    status_code: Option<i64>,
    state: State,

    ctx: Option<Context>,
    backend: Arc<dyn Backend>,
    spawner: Arc<dyn Spawner>,
    demux: Arc<dyn Demultiplexer>,

    close_after_stdin: Vec<Box<dyn Close>>,
    close_after_output: Vec<Box<dyn Close>>,
    close_after_wait: Vec<Box<dyn Close>>,
    // Stdin pipes end once the unit is gone, so the input pump can drain.
    close_on_exit: Vec<Box<dyn Close>>,
    pump_count: usize,
    // One message per pump
    completions: Option<Receiver<io::Result<()>>>,
    registration: Option<WaitRegistration>,
    // Dropped by `wait` to release the cancellation watcher
    wait_done: Option<Sender<()>>,
    // Held while the kill is in flight so `wait` never returns before it lands
    kill_sent: Arc<AsyncMutex<bool>>,
}

impl Cmd {
    /// A command running `program` with `args` inside `image`
    pub fn new<I, S>(
        backend: Arc<dyn Backend>,
        image: impl Into<String>,
        program: impl Into<String>,
        args: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_config(backend, UnitConfig::new(image, program, args))
    }

    /// Like [`new`](Self::new), with a context.
    ///
    /// If the context becomes done before the unit exits on its own, the
    /// unit is killed and [`wait`](Self::wait) reports the context's error.
    pub fn with_context<I, S>(
        ctx: Context,
        backend: Arc<dyn Backend>,
        image: impl Into<String>,
        program: impl Into<String>,
        args: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cmd = Self::new(backend, image, program, args);
        cmd.ctx = Some(ctx);
        cmd
    }

    /// A command for a fully specified unit configuration
    pub fn from_config(backend: Arc<dyn Backend>, config: UnitConfig) -> Self {
        let demux = backend.demultiplexer();
        Self {
            config,
            name: None,
            stdin: None,
            stdout: None,
            stderr: None,
            id: None,
            warnings: Vec::new(),
            status_code: None,
            state: State::Unstarted,
            ctx: None,
            backend,
            spawner: default_spawner(),
            demux,
            close_after_stdin: Vec::new(),
            close_after_output: Vec::new(),
            close_after_wait: Vec::new(),
            close_on_exit: Vec::new(),
            pump_count: 0,
            completions: None,
            registration: None,
            wait_done: None,
            kill_sent: Arc::new(AsyncMutex::new(false)),
        }
    }

    /// Set the context used to cancel the unit
    pub fn set_context(&mut self, ctx: Context) -> &mut Self {
        self.ctx = Some(ctx);
        self
    }

    /// Spawn pumps and the cancellation watcher with `spawner`
    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Decode combined output with `demux` instead of the backend's default
    pub fn with_demultiplexer(mut self, demux: Arc<dyn Demultiplexer>) -> Self {
        self.demux = demux;
        self
    }

    /// Name the unit
    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    /// The unit configuration
    pub fn config(&self) -> &UnitConfig {
        &self.config
    }

    /// Mutable access to the unit configuration
    pub fn config_mut(&mut self) -> &mut UnitConfig {
        &mut self.config
    }

    /// Read the unit's standard input from `reader`
    pub fn stdin(&mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> &mut Self {
        self.stdin = Some(Box::new(reader));
        self
    }

    /// Write the unit's standard output to `writer`
    pub fn stdout(&mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> &mut Self {
        self.stdout = Some(Box::new(writer));
        self
    }

    /// Write the unit's standard error to `writer`
    pub fn stderr(&mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> &mut Self {
        self.stderr = Some(Box::new(writer));
        self
    }

    /// The unit's ID, once started
    pub fn id(&self) -> Option<&UnitId> {
        self.id.as_ref()
    }

    /// Warnings the backend reported while creating the unit.
    ///
    /// These are also logged at `warn` level.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// The unit's exit status, available after [`wait`](Self::wait)
    pub fn status_code(&self) -> Option<i64> {
        self.status_code
    }

    /// Start the unit and wait for it to complete.
    ///
    /// The result is `Ok` if the unit runs, has no problems copying stdin,
    /// stdout and stderr, and exits with status zero. A unit that runs but
    /// fails yields [`Error::Exit`].
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.wait().await
    }

    /// Start the unit without waiting for it to complete.
    ///
    /// On success [`id`](Self::id) is set. [`wait`](Self::wait) then
    /// reports the exit and releases associated resources.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != State::Unstarted {
            return Err(Error::AlreadyStarted);
        }
        if self.config.tty && self.stderr.is_some() {
            return Err(Error::TtyWithStderr);
        }
        if let Some(err) = self.ctx.as_ref().and_then(Context::err) {
            self.release();
            return Err(err.into());
        }

        if self.stdin.is_some() {
            self.config.open_stdin = true;
        }

        let created = match self.backend.create(&self.config, self.name.as_deref()).await {
            Ok(created) => created,
            Err(e) => {
                self.release();
                return Err(e);
            }
        };
        let id = created.id;
        for warning in &created.warnings {
            warn!(unit = %id, "{}", warning);
        }
        self.warnings = created.warnings;

        let options = AttachOptions {
            stdin: self.stdin.is_some(),
            stdout: self.stdout.is_some(),
            stderr: self.stderr.is_some(),
        };
        let pumps = match self.backend.attach(&id, options).await {
            Ok(attachment) => self.register_pumps(attachment),
            Err(e) => Err(e),
        };
        let pumps = match pumps {
            Ok(pumps) => pumps,
            Err(e) => {
                self.abort(&id).await;
                return Err(e);
            }
        };

        let registration = self.backend.wait(&id);

        if let Err(e) = self.backend.start(&id).await {
            drop(pumps);
            self.abort(&id).await;
            return Err(e);
        }

        debug!(unit = %id, pumps = pumps.len(), "unit started");
        self.id = Some(id.clone());
        self.state = State::Started;
        self.registration = Some(registration);
        self.launch_pumps(pumps);

        if let Some(ctx) = self.ctx.clone() {
            self.watch(ctx, id);
        }

        Ok(())
    }

    /// Build the pumps for the bound streams
    fn register_pumps(&mut self, attachment: Attachment) -> Result<Vec<Pump>> {
        let Attachment { input, output } = attachment;
        let mut pumps = Vec::new();

        if let Some(source) = self.stdin.take() {
            let conn = input.ok_or_else(|| Error::backend("attach", "stdin was not attached"))?;
            pumps.push(Pump::input(source, conn));
        }

        if self.stdout.is_some() || self.stderr.is_some() {
            let stdout = self.stdout.take().unwrap_or_else(discard);
            let pump = if self.config.tty {
                Pump::raw(output, stdout)
            } else {
                let stderr = self.stderr.take().unwrap_or_else(discard);
                Pump::demux(output, stdout, stderr, self.demux.clone())
            };
            pumps.push(pump);
        }

        Ok(pumps)
    }

    fn launch_pumps(&mut self, pumps: Vec<Pump>) {
        let mut after_stdin = mem::take(&mut self.close_after_stdin);
        let mut after_output = mem::take(&mut self.close_after_output);

        if !pumps.is_empty() {
            let (tx, rx) = async_channel::bounded(pumps.len());
            self.pump_count = pumps.len();
            for mut pump in pumps {
                if pump.is_input() {
                    pump.close_after(mem::take(&mut after_stdin));
                } else {
                    pump.close_after(mem::take(&mut after_output));
                }
                let tx = tx.clone();
                self.spawner.spawn(Box::pin(async move {
                    let _ = tx.send(pump.run().await).await;
                }));
            }
            self.completions = Some(rx);
        }

        // Anything no pump will release waits for `wait`.
        self.close_after_wait.append(&mut after_stdin);
        self.close_after_wait.append(&mut after_output);
    }

    /// Kill the unit if the context is done before `wait` finishes
    fn watch(&mut self, ctx: Context, id: UnitId) {
        let (done_tx, done_rx) = async_channel::bounded::<()>(1);
        self.wait_done = Some(done_tx);
        let backend = self.backend.clone();
        let kill_sent = self.kill_sent.clone();

        self.spawner.spawn(Box::pin(async move {
            let finished = done_rx.recv();
            let cancelled = ctx.done();
            futures::pin_mut!(finished, cancelled);
            // Once `wait` has its outcome it sends the kill itself if one is due.
            if let Either::Right(_) = select(finished, cancelled).await {
                kill_unit(&*backend, &id, &kill_sent).await;
            }
        }));
    }

    /// Wait for the unit to exit and for any copying to stdin or from
    /// stdout and stderr to complete.
    ///
    /// The command must have been started by [`start`](Self::start).
    ///
    /// The result is `Ok` if the unit runs, has no problems copying stdin,
    /// stdout and stderr, and exits with status zero. A non-zero exit yields
    /// [`Error::Exit`]; a done context yields [`Error::Context`].
    ///
    /// `wait` releases every resource associated with the command,
    /// including the caller's ends of pipes from
    /// [`stdout_pipe`](Self::stdout_pipe) and
    /// [`stderr_pipe`](Self::stderr_pipe), so finish reading those first.
    pub async fn wait(&mut self) -> Result<()> {
        match self.state {
            State::Unstarted => return Err(Error::NotStarted),
            State::Waited => return Err(Error::AlreadyWaited),
            State::Started => {}
        }
        self.state = State::Waited;

        let outcome = match self.registration.take() {
            Some(registration) => Self::wait_for_exit(self.ctx.clone(), registration, &self.kill_sent).await,
            None => Err(Error::backend("wait", "no exit registration")),
        };
        if let (Err(Error::Context(_)), Some(id)) = (&outcome, &self.id) {
            kill_unit(&*self.backend, id, &self.kill_sent).await;
        }
        self.wait_done.take();
        close_all(&mut self.close_on_exit);

        let unit_err = match outcome {
            Ok(WaitResponse {
                error: Some(message),
                ..
            }) => Some(Error::Unit { message }),
            Ok(WaitResponse { status_code, .. }) => {
                self.status_code = Some(status_code);
                None
            }
            Err(e) => Some(e),
        };

        let copy_err = self.drain_pumps().await;
        close_all(&mut self.close_after_wait);

        if let Some(err) = unit_err {
            debug!(unit = ?self.id, error = %err, "unit wait failed");
            return Err(err);
        }
        debug!(unit = ?self.id, status = ?self.status_code, "unit exited");
        match (self.status_code, copy_err) {
            (Some(code), _) if code != 0 => Err(ExitError::new(code).into()),
            (_, Some(e)) => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn wait_for_exit(
        ctx: Option<Context>,
        registration: WaitRegistration,
        kill_sent: &AsyncMutex<bool>,
    ) -> Result<WaitResponse> {
        let Some(ctx) = ctx else {
            return registration.recv().await;
        };
        // An exit caused by our own kill reports the context instead.
        let killed = || kill_sent.try_lock().is_none_or(|sent| *sent);

        if !ctx.is_done() {
            let cancelled = ctx.done();
            let exited = registration.recv();
            futures::pin_mut!(cancelled, exited);
            if let Either::Right((outcome, _)) = select(cancelled, exited).await {
                if !killed() {
                    return outcome;
                }
            }
        }

        // An exit already reported wins over the context.
        match registration.status.try_recv() {
            Ok(response) if !killed() => Ok(response),
            _ => Err(ctx.err().unwrap_or(ContextError::Canceled).into()),
        }
    }

    /// Collect one result per pump, keeping the first error
    async fn drain_pumps(&mut self) -> Option<io::Error> {
        let completions = self.completions.take()?;
        let mut first = None;
        for _ in 0..self.pump_count {
            let result = completions
                .recv()
                .await
                .unwrap_or_else(|_| Err(io::Error::other("stream pump stopped without reporting")));
            if let Err(e) = result {
                if first.is_none() {
                    first = Some(e);
                }
            }
        }
        first
    }

    /// Close everything acquired for a start attempt
    fn release(&mut self) {
        close_all(&mut self.close_after_stdin);
        close_all(&mut self.close_after_output);
        close_all(&mut self.close_after_wait);
        close_all(&mut self.close_on_exit);
    }

    /// Undo a partially started unit
    async fn abort(&mut self, id: &UnitId) {
        self.release();
        let options = RemoveOptions {
            force: true,
            remove_volumes: true,
        };
        if let Err(e) = self.backend.remove(id, options).await {
            warn!(unit = %id, error = %e, "failed to remove unit after failed start");
        }
    }

    /// Run the unit and return its standard output.
    ///
    /// If stderr was not bound, a failing unit's [`ExitError::stderr`]
    /// holds an excerpt of what it wrote there.
    pub async fn output(&mut self) -> Result<Vec<u8>> {
        if self.stdout.is_some() {
            return Err(Error::StdoutAlreadySet);
        }
        let stdout = SharedBuffer::new();
        self.stdout = Some(Box::new(stdout.clone()));

        let capture = (self.stderr.is_none() && !self.config.tty)
            .then(|| SharedCapture::new(DEFAULT_CAPTURE_SIZE));
        if let Some(capture) = &capture {
            self.stderr = Some(Box::new(capture.clone()));
        }

        match self.run().await {
            Ok(()) => Ok(stdout.take()),
            Err(Error::Exit(mut exit)) => {
                if let Some(capture) = capture {
                    exit.stderr = capture.bytes();
                }
                exit.output = stdout.take();
                Err(Error::Exit(exit))
            }
            Err(e) => Err(e),
        }
    }

    /// Run the unit and return its standard output and standard error
    /// interleaved in arrival order
    pub async fn combined_output(&mut self) -> Result<Vec<u8>> {
        if self.stdout.is_some() {
            return Err(Error::StdoutAlreadySet);
        }
        if self.stderr.is_some() {
            return Err(Error::StderrAlreadySet);
        }
        let combined = SharedBuffer::new();
        self.stdout = Some(Box::new(combined.clone()));
        if !self.config.tty {
            self.stderr = Some(Box::new(combined.clone()));
        }

        match self.run().await {
            Ok(()) => Ok(combined.take()),
            Err(Error::Exit(mut exit)) => {
                exit.output = combined.take();
                Err(Error::Exit(exit))
            }
            Err(e) => Err(e),
        }
    }

    /// A pipe connected to the unit's standard input once it starts.
    ///
    /// The pipe is closed automatically once `wait` sees the unit exit or
    /// the context end, unlike a reader bound with [`stdin`](Self::stdin),
    /// which `wait` never closes. Close it sooner if the unit only exits
    /// once its input ends.
    pub fn stdin_pipe(&mut self) -> Result<StdinPipe> {
        if self.stdin.is_some() {
            return Err(Error::StdinAlreadySet);
        }
        if self.state != State::Unstarted {
            return Err(Error::PipeAfterStart { stream: "stdin" });
        }
        let (reader, writer) = pipe();
        self.close_after_stdin.push(Box::new(reader.closer()));
        self.stdin = Some(Box::new(reader));

        let once = Arc::new(CloseOnce::new(writer.closer()));
        self.close_after_wait.push(Box::new(once.clone()));
        self.close_on_exit.push(Box::new(once.clone()));
        Ok(StdinPipe { writer, once })
    }

    /// A pipe connected to the unit's standard output once it starts.
    ///
    /// `wait` closes the pipe after the unit exits, so most callers need not
    /// close it themselves. It is thus incorrect to call `wait` before all
    /// reads from the pipe have completed, and incorrect to use `run` with
    /// it.
    pub fn stdout_pipe(&mut self) -> Result<PipeReader> {
        if self.stdout.is_some() {
            return Err(Error::StdoutAlreadySet);
        }
        if self.state != State::Unstarted {
            return Err(Error::PipeAfterStart { stream: "stdout" });
        }
        let (reader, writer) = self.output_pipe();
        self.stdout = Some(Box::new(writer));
        Ok(reader)
    }

    /// A pipe connected to the unit's standard error once it starts.
    ///
    /// See [`stdout_pipe`](Self::stdout_pipe) for when it is closed.
    pub fn stderr_pipe(&mut self) -> Result<PipeReader> {
        if self.stderr.is_some() {
            return Err(Error::StderrAlreadySet);
        }
        if self.state != State::Unstarted {
            return Err(Error::PipeAfterStart { stream: "stderr" });
        }
        let (reader, writer) = self.output_pipe();
        self.stderr = Some(Box::new(writer));
        Ok(reader)
    }

    fn output_pipe(&mut self) -> (PipeReader, PipeWriter) {
        let (reader, writer) = pipe();
        self.close_after_output.push(Box::new(writer.closer()));
        self.close_after_wait.push(Box::new(reader.closer()));
        (reader, writer)
    }
}

/// Ask the backend to kill the unit, at most once per command
async fn kill_unit(backend: &dyn Backend, id: &UnitId, kill_sent: &AsyncMutex<bool>) {
    let mut sent = kill_sent.lock().await;
    if *sent {
        return;
    }
    *sent = true;
    debug!(unit = %id, "context done, killing unit");
    if let Err(e) = backend.kill(id, "SIGKILL").await {
        debug!(unit = %id, error = %e, "kill after cancellation failed");
    }
}

impl fmt::Display for Cmd {
    /// The entrypoint and command, for debugging
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, word) in self.config.argv().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(word)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cmd")
            .field("config", &self.config)
            .field("name", &self.name)
            .field("id", &self.id)
            .field("state", &self.state)
            .field("status_code", &self.status_code)
            .finish_non_exhaustive()
    }
}

/// Writer for a unit's standard input, returned by [`Cmd::stdin_pipe`].
///
/// Closing it (`AsyncWriteExt::close`) signals EOF to the unit. Closing more
/// than once is fine; every close reports the first outcome.
pub struct StdinPipe {
    writer: PipeWriter,
    once: Arc<CloseOnce<PipeCloser>>,
}

impl AsyncWrite for StdinPipe {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.once.close())
    }
}

impl fmt::Debug for StdinPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdinPipe")
            .field("closed", &self.once.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::LocalBackend;

    fn local(program: &str, args: &[&str]) -> Cmd {
        Cmd::new(Arc::new(LocalBackend::new()), "local", program, args.iter().copied())
    }

    #[test]
    fn test_display_joins_words() {
        let mut cmd = local("sh", &["-c", "echo Hello, World!"]);
        assert_eq!(cmd.to_string(), "sh -c echo Hello, World!");

        cmd.config_mut().entrypoint = vec!["/usr/bin/env".into()];
        assert_eq!(cmd.to_string(), "/usr/bin/env sh -c echo Hello, World!");
    }

    #[test]
    fn test_pipe_accessors_reject_bound_streams() {
        let mut cmd = local("cat", &[]);
        cmd.stdin(&b"input"[..]);
        cmd.stdout(SharedBuffer::new());
        cmd.stderr(SharedBuffer::new());

        assert!(matches!(cmd.stdin_pipe(), Err(Error::StdinAlreadySet)));
        assert!(matches!(cmd.stdout_pipe(), Err(Error::StdoutAlreadySet)));
        assert!(matches!(cmd.stderr_pipe(), Err(Error::StderrAlreadySet)));
    }

    #[smol_potat::test]
    async fn test_output_rejects_bound_stdout() {
        let mut cmd = local("true", &[]);
        let _stdout = cmd.stdout_pipe().unwrap();
        assert!(matches!(cmd.output().await, Err(Error::StdoutAlreadySet)));
        assert!(matches!(cmd.combined_output().await, Err(Error::StdoutAlreadySet)));
    }

    #[smol_potat::test]
    async fn test_combined_output_rejects_bound_stderr() {
        let mut cmd = local("true", &[]);
        cmd.stderr(SharedBuffer::new());
        assert!(matches!(cmd.combined_output().await, Err(Error::StderrAlreadySet)));
    }

    #[test]
    fn test_status_code_unset_before_run() {
        let cmd = local("cat", &[]);
        assert_eq!(cmd.status_code(), None);
        assert!(cmd.id().is_none());
        assert!(cmd.warnings().is_empty());
    }
}
