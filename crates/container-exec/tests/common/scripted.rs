//! A backend that plays back a script and records every call

use std::sync::Mutex;

use async_trait::async_trait;
use container_exec::demux::encode_frame;
use container_exec::{
    AttachOptions, Attachment, Backend, Created, Error, RemoveOptions, Result, SharedBuffer, StreamType,
    UnitConfig, UnitId, WaitNotifier, WaitRegistration, WaitResponse,
};

/// A backend call, in the order it was made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create,
    Attach(AttachOptions),
    Wait,
    Start,
    Kill(String),
    Remove(RemoveOptions),
}

/// What the unit does once started
#[derive(Debug, Clone)]
pub enum Exit {
    /// Exit as soon as it is started
    OnStart(WaitResponse),
    /// Run until killed, then exit with 128 + 9
    OnKill,
    /// Waiting on the unit fails
    WaitFails(String),
}

/// Which operation should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fail {
    Create,
    Attach,
    Start,
}

#[derive(Debug)]
pub struct Script {
    pub warnings: Vec<String>,
    pub fail: Option<Fail>,
    /// Bytes served on the attached output stream
    pub output: Vec<u8>,
    pub exit: Exit,
}

impl Script {
    /// A unit that exits with `status_code` right away
    pub fn exits(status_code: i64) -> Self {
        Self {
            warnings: Vec::new(),
            fail: None,
            output: Vec::new(),
            exit: Exit::OnStart(WaitResponse::exited(status_code)),
        }
    }

    /// A unit that runs until killed
    pub fn runs_until_killed() -> Self {
        Self {
            exit: Exit::OnKill,
            ..Self::exits(0)
        }
    }

    pub fn failing(mut self, fail: Fail) -> Self {
        self.fail = Some(fail);
        self
    }

    pub fn stdout(mut self, data: &[u8]) -> Self {
        encode_frame(StreamType::Stdout, data, &mut self.output);
        self
    }

    pub fn stderr(mut self, data: &[u8]) -> Self {
        encode_frame(StreamType::Stderr, data, &mut self.output);
        self
    }

    pub fn raw(mut self, data: &[u8]) -> Self {
        self.output.extend_from_slice(data);
        self
    }
}

pub struct ScriptedBackend {
    script: Script,
    calls: Mutex<Vec<Call>>,
    configs: Mutex<Vec<UnitConfig>>,
    notifiers: Mutex<Vec<WaitNotifier>>,
    stdin: SharedBuffer,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            calls: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
            notifiers: Mutex::new(Vec::new()),
            stdin: SharedBuffer::new(),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// The configuration passed to the last `create`
    pub fn last_config(&self) -> Option<UnitConfig> {
        self.configs.lock().unwrap().last().cloned()
    }

    /// Everything written to the unit's stdin
    pub fn stdin(&self) -> Vec<u8> {
        self.stdin.contents()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn fails(&self, fail: Fail, operation: &'static str) -> Result<()> {
        if self.script.fail == Some(fail) {
            return Err(Error::backend(operation, "scripted failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn create(&self, config: &UnitConfig, _name: Option<&str>) -> Result<Created> {
        self.record(Call::Create);
        self.configs.lock().unwrap().push(config.clone());
        self.fails(Fail::Create, "create")?;
        Ok(Created {
            id: UnitId::new("scripted"),
            warnings: self.script.warnings.clone(),
        })
    }

    async fn attach(&self, _id: &UnitId, options: AttachOptions) -> Result<Attachment> {
        self.record(Call::Attach(options));
        self.fails(Fail::Attach, "attach")?;

        let output = if options.stdout || options.stderr {
            self.script.output.clone()
        } else {
            Vec::new()
        };
        Ok(Attachment {
            input: options
                .stdin
                .then(|| Box::new(self.stdin.clone()) as container_exec::stream::BoxWriter),
            output: Box::new(futures::io::Cursor::new(output)),
        })
    }

    async fn start(&self, _id: &UnitId) -> Result<()> {
        self.record(Call::Start);
        self.fails(Fail::Start, "start")?;

        let notifiers = self.notifiers.lock().unwrap();
        match &self.script.exit {
            Exit::OnStart(response) => notifiers.iter().for_each(|n| n.exited(response.clone())),
            Exit::WaitFails(message) => notifiers.iter().for_each(|n| {
                n.fail(Error::Unit {
                    message: message.clone(),
                })
            }),
            Exit::OnKill => {}
        }
        Ok(())
    }

    fn wait(&self, _id: &UnitId) -> WaitRegistration {
        self.record(Call::Wait);
        let (notifier, registration) = WaitRegistration::channel();
        self.notifiers.lock().unwrap().push(notifier);
        registration
    }

    async fn kill(&self, _id: &UnitId, signal: &str) -> Result<()> {
        self.record(Call::Kill(signal.to_string()));
        for notifier in self.notifiers.lock().unwrap().iter() {
            notifier.exited(WaitResponse::exited(137));
        }
        Ok(())
    }

    async fn remove(&self, _id: &UnitId, options: RemoveOptions) -> Result<()> {
        self.record(Call::Remove(options));
        Ok(())
    }
}
