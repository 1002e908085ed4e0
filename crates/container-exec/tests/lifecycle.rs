//! Lifecycle tests against a scripted backend

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::eventually;
use common::scripted::{Call, Exit, Fail, Script, ScriptedBackend};
use container_exec::{
    AttachOptions, Cmd, Context, ContextError, Error, RemoveOptions, SharedBuffer, UnitConfig, WaitResponse,
};
use futures::io::AsyncWriteExt;

fn scripted(script: Script) -> Arc<ScriptedBackend> {
    Arc::new(ScriptedBackend::new(script))
}

const FORCE_REMOVE: RemoveOptions = RemoveOptions {
    force: true,
    remove_volumes: true,
};

#[smol_potat::test]
async fn test_run_calls_backend_in_order() {
    let backend = scripted(Script::exits(0).stdout(b"Hello, World!\n"));
    let mut cmd = Cmd::new(backend.clone(), "ubuntu:focal", "sh", ["-c", "echo Hello, World!"]);

    let output = cmd.output().await.unwrap();
    assert_eq!(output, b"Hello, World!\n");
    assert_eq!(cmd.status_code(), Some(0));
    assert_eq!(cmd.id().map(|id| id.as_str()), Some("scripted"));

    assert_eq!(
        backend.calls(),
        vec![
            Call::Create,
            Call::Attach(AttachOptions {
                stdin: false,
                stdout: true,
                stderr: true,
            }),
            Call::Wait,
            Call::Start,
        ]
    );
}

#[smol_potat::test]
async fn test_already_cancelled_context_makes_no_backend_calls() {
    let backend = scripted(Script::exits(0));
    let ctx = Context::new();
    ctx.cancel();

    let mut cmd = Cmd::with_context(ctx, backend.clone(), "ubuntu:focal", "sleep", ["120"]);
    let err = cmd.start().await.unwrap_err();

    assert!(matches!(err, Error::Context(ContextError::Canceled)));
    assert!(err.is_cancelled());
    assert!(backend.calls().is_empty());
    assert!(cmd.id().is_none());
}

#[smol_potat::test]
async fn test_create_failure_is_returned_without_cleanup() {
    let backend = scripted(Script::exits(0).failing(Fail::Create));
    let mut cmd = Cmd::new(backend.clone(), "ubuntu:focal", "true", Vec::<String>::new());

    let err = cmd.run().await.unwrap_err();
    assert!(matches!(err, Error::Backend { operation: "create", .. }));
    assert_eq!(backend.calls(), vec![Call::Create]);

    // A failed start leaves the command unstarted.
    assert!(matches!(cmd.wait().await, Err(Error::NotStarted)));
}

#[smol_potat::test]
async fn test_attach_failure_removes_unit() {
    let backend = scripted(Script::exits(0).failing(Fail::Attach));
    let mut cmd = Cmd::new(backend.clone(), "ubuntu:focal", "cat", Vec::<String>::new());
    let _stdout = cmd.stdout_pipe().unwrap();

    let err = cmd.start().await.unwrap_err();
    assert!(matches!(err, Error::Backend { operation: "attach", .. }));
    assert_eq!(
        backend.calls().last(),
        Some(&Call::Remove(FORCE_REMOVE))
    );
    assert!(cmd.id().is_none());
}

#[smol_potat::test]
async fn test_start_failure_removes_unit() {
    let backend = scripted(Script::exits(0).failing(Fail::Start));
    let mut cmd = Cmd::new(backend.clone(), "ubuntu:focal", "/no-exist-executable", Vec::<String>::new());

    let err = cmd.run().await.unwrap_err();
    assert!(matches!(err, Error::Backend { operation: "start", .. }));
    assert_eq!(
        backend.calls(),
        vec![
            Call::Create,
            Call::Attach(AttachOptions::default()),
            Call::Wait,
            Call::Start,
            Call::Remove(FORCE_REMOVE),
        ]
    );
}

#[smol_potat::test]
async fn test_failed_start_releases_pipes() {
    let backend = scripted(Script::exits(0).failing(Fail::Start));
    let mut cmd = Cmd::new(backend, "ubuntu:focal", "cat", Vec::<String>::new());
    let mut stdin = cmd.stdin_pipe().unwrap();

    cmd.start().await.unwrap_err();

    let err = stdin.write_all(b"late").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
}

#[smol_potat::test]
async fn test_warnings_are_exposed() {
    let mut script = Script::exits(0);
    script.warnings = vec!["Your kernel does not support swap limit capabilities".into()];
    let backend = scripted(script);

    let mut cmd = Cmd::new(backend, "ubuntu:focal", "true", Vec::<String>::new());
    cmd.run().await.unwrap();
    assert_eq!(
        cmd.warnings(),
        &["Your kernel does not support swap limit capabilities".to_string()]
    );
}

#[smol_potat::test]
async fn test_bound_stdin_opens_stdin_and_is_copied() {
    const INPUT: &[u8] = b"Line 1\nLine 2";
    let backend = scripted(Script::exits(0));
    let mut cmd = Cmd::new(backend.clone(), "ubuntu:focal", "cat", Vec::<String>::new());
    cmd.stdin(INPUT);

    cmd.run().await.unwrap();

    let config = backend.last_config().unwrap();
    assert!(config.open_stdin);
    assert!(config.stdin_once);
    assert_eq!(backend.stdin(), INPUT);
}

#[smol_potat::test]
async fn test_unbound_stdin_leaves_config_alone() {
    let backend = scripted(Script::exits(0));
    let mut cmd = Cmd::new(backend.clone(), "ubuntu:focal", "true", Vec::<String>::new());
    cmd.run().await.unwrap();
    assert!(!backend.last_config().unwrap().open_stdin);
}

#[smol_potat::test]
async fn test_status_takes_precedence_over_copy_error() {
    let backend = scripted(Script::exits(3).stdout(b"partial").raw(&[9, 0, 0, 0, 0, 0, 0, 1, b'x']));
    let mut cmd = Cmd::new(backend, "ubuntu:focal", "sh", ["-c", "exit 3"]);
    cmd.stdout(SharedBuffer::new());

    let err = cmd.run().await.unwrap_err();
    let exit = err.exit_status().unwrap();
    assert_eq!(exit.status_code, 3);
    assert_eq!(err.to_string(), "exit status 3");
}

#[smol_potat::test]
async fn test_copy_error_reported_on_clean_exit() {
    let backend = scripted(Script::exits(0).stdout(b"partial").raw(&[9, 0, 0, 0, 0, 0, 0, 1, b'x']));
    let mut cmd = Cmd::new(backend, "ubuntu:focal", "true", Vec::<String>::new());
    let stdout = SharedBuffer::new();
    cmd.stdout(stdout.clone());

    let err = cmd.run().await.unwrap_err();
    assert!(matches!(&err, Error::Io(e) if e.kind() == std::io::ErrorKind::InvalidData));
    assert_eq!(cmd.status_code(), Some(0));
    assert_eq!(stdout.contents(), b"partial");
}

#[smol_potat::test]
async fn test_unit_error_from_wait_response() {
    let mut script = Script::exits(0);
    script.exit = Exit::OnStart(WaitResponse {
        status_code: 0,
        error: Some("container vanished".into()),
    });
    let backend = scripted(script);
    let mut cmd = Cmd::new(backend, "ubuntu:focal", "true", Vec::<String>::new());

    let err = cmd.run().await.unwrap_err();
    assert!(matches!(&err, Error::Unit { message } if message == "container vanished"));
    assert_eq!(cmd.status_code(), None);
}

#[smol_potat::test]
async fn test_wait_error_channel() {
    let mut script = Script::exits(0);
    script.exit = Exit::WaitFails("wait stream broke".into());
    let backend = scripted(script);
    let mut cmd = Cmd::new(backend, "ubuntu:focal", "true", Vec::<String>::new());

    let err = cmd.run().await.unwrap_err();
    assert_eq!(err.to_string(), "wait stream broke");
}

#[smol_potat::test]
async fn test_output_fills_exit_error() {
    let backend = scripted(Script::exits(1).stdout(b"some output\n").stderr(b"stderr\n"));
    let mut cmd = Cmd::new(backend, "ubuntu:focal", "sh", ["-c", "echo stderr >&2; exit 1"]);

    let err = cmd.output().await.unwrap_err();
    let exit = match err {
        Error::Exit(exit) => exit,
        other => panic!("expected an exit error, got {other:?}"),
    };
    assert_eq!(exit.status_code, 1);
    assert_eq!(exit.stderr, b"stderr\n");
    assert_eq!(exit.output, b"some output\n");
}

#[smol_potat::test]
async fn test_output_keeps_caller_stderr() {
    let backend = scripted(Script::exits(1).stderr(b"stderr\n"));
    let mut cmd = Cmd::new(backend, "ubuntu:focal", "sh", ["-c", "echo stderr >&2; exit 1"]);
    let stderr = SharedBuffer::new();
    cmd.stderr(stderr.clone());

    let err = cmd.output().await.unwrap_err();
    assert!(err.exit_status().unwrap().stderr.is_empty());
    assert_eq!(stderr.contents(), b"stderr\n");
}

#[smol_potat::test]
async fn test_combined_output_interleaves() {
    let backend = scripted(Script::exits(1).stderr(b"cat: /bogus/file.foo: No such file\n").stdout(b"Ubuntu\n"));
    let mut cmd = Cmd::new(backend, "ubuntu:focal", "sh", ["-c", "cat /bogus/file.foo; cat /etc/os-release; exit 1"]);

    let err = cmd.combined_output().await.unwrap_err();
    let exit = err.exit_status().unwrap();
    assert_eq!(exit.output, b"cat: /bogus/file.foo: No such file\nUbuntu\n");
}

#[smol_potat::test]
async fn test_tty_output_is_raw() {
    let backend = scripted(Script::exits(0).raw(b"/dev/pts/0\r\n"));
    let config = UnitConfig::new("ubuntu:focal", "tty", Vec::<String>::new()).tty(true);
    let mut cmd = Cmd::from_config(backend.clone(), config);

    let output = cmd.output().await.unwrap();
    assert_eq!(output, b"/dev/pts/0\r\n");
    assert_eq!(
        backend.calls()[1],
        Call::Attach(AttachOptions {
            stdin: false,
            stdout: true,
            stderr: false,
        })
    );
}

#[smol_potat::test]
async fn test_tty_and_stderr_rejected() {
    let backend = scripted(Script::exits(0));
    let config = UnitConfig::new("ubuntu:focal", "sh", ["-c", "echo Hello, World!"]).tty(true);
    let mut cmd = Cmd::from_config(backend.clone(), config);
    let _stderr = cmd.stderr_pipe().unwrap();

    let err = cmd.run().await.unwrap_err();
    assert!(matches!(err, Error::TtyWithStderr));
    assert_eq!(err.to_string(), "container-exec: can't set both tty and stderr");
    assert!(backend.calls().is_empty());
}

#[smol_potat::test]
async fn test_misuse_errors() {
    let backend = scripted(Script::exits(0));
    let mut cmd = Cmd::new(backend, "ubuntu:focal", "true", Vec::<String>::new());

    assert!(matches!(cmd.wait().await, Err(Error::NotStarted)));

    cmd.start().await.unwrap();
    assert!(matches!(cmd.start().await, Err(Error::AlreadyStarted)));
    assert!(matches!(cmd.stdin_pipe(), Err(Error::PipeAfterStart { stream: "stdin" })));
    assert!(matches!(cmd.stdout_pipe(), Err(Error::PipeAfterStart { stream: "stdout" })));
    assert!(matches!(cmd.stderr_pipe(), Err(Error::PipeAfterStart { stream: "stderr" })));

    cmd.wait().await.unwrap();
    let err = cmd.wait().await.unwrap_err();
    assert!(matches!(err, Error::AlreadyWaited));
    assert_eq!(err.to_string(), "container-exec: wait was already called");
    assert!(matches!(cmd.start().await, Err(Error::AlreadyStarted)));
}

#[smol_potat::test]
async fn test_cancel_after_start_kills_unit() {
    let backend = scripted(Script::runs_until_killed());
    let ctx = Context::new();
    let mut cmd = Cmd::with_context(ctx.clone(), backend.clone(), "ubuntu:focal", "sleep", ["120"]);

    cmd.start().await.unwrap();
    ctx.cancel();

    let err = cmd.wait().await.unwrap_err();
    assert!(matches!(err, Error::Context(ContextError::Canceled)));
    assert_eq!(err.to_string(), "context canceled");
    assert!(backend.calls().contains(&Call::Kill("SIGKILL".into())));
}

#[smol_potat::test]
async fn test_cancel_then_wait_always_kills_once() {
    for round in 0..50 {
        let backend = scripted(Script::runs_until_killed());
        let ctx = Context::new();
        let mut cmd = Cmd::with_context(ctx.clone(), backend.clone(), "ubuntu:focal", "sleep", ["120"]);

        cmd.start().await.unwrap();
        ctx.cancel();
        assert!(cmd.wait().await.unwrap_err().is_cancelled());

        let kills = backend.calls().iter().filter(|c| matches!(c, Call::Kill(_))).count();
        assert_eq!(kills, 1, "round {}: {:?}", round, backend.calls());
    }
}

#[smol_potat::test]
async fn test_cancel_without_wait_kills_unit() {
    let backend = scripted(Script::runs_until_killed());
    let ctx = Context::new();
    let mut cmd = Cmd::with_context(ctx.clone(), backend.clone(), "ubuntu:focal", "sleep", ["120"]);

    cmd.start().await.unwrap();
    ctx.cancel();

    let killed = eventually(Duration::from_secs(5), || {
        backend.calls().contains(&Call::Kill("SIGKILL".into()))
    })
    .await;
    assert!(killed, "unit was not killed: {:?}", backend.calls());
}

#[smol_potat::test]
async fn test_reported_exit_wins_over_later_cancel() {
    let backend = scripted(Script::exits(0));
    let ctx = Context::new();
    let mut cmd = Cmd::with_context(ctx.clone(), backend.clone(), "ubuntu:focal", "true", Vec::<String>::new());

    cmd.start().await.unwrap();
    ctx.cancel();

    cmd.wait().await.unwrap();
    assert_eq!(cmd.status_code(), Some(0));
}

#[smol_potat::test]
async fn test_deadline_exceeded() {
    let backend = scripted(Script::runs_until_killed());
    let ctx = Context::with_timeout(Duration::from_millis(50));
    let mut cmd = Cmd::with_context(ctx, backend, "ubuntu:focal", "sleep", ["120"]);

    cmd.start().await.unwrap();
    let err = cmd.wait().await.unwrap_err();
    assert!(matches!(err, Error::Context(ContextError::DeadlineExceeded)));
}

#[smol_potat::test]
async fn test_finished_unit_is_not_killed() {
    let backend = scripted(Script::exits(0));
    let ctx = Context::new();
    let mut cmd = Cmd::with_context(ctx.clone(), backend.clone(), "ubuntu:focal", "true", Vec::<String>::new());

    cmd.run().await.unwrap();
    ctx.cancel();
    smol::Timer::after(Duration::from_millis(50)).await;

    assert!(!backend.calls().iter().any(|c| matches!(c, Call::Kill(_))));
}

#[smol_potat::test]
async fn test_stdin_pipe_double_close() {
    let backend = scripted(Script::exits(0));
    let mut cmd = Cmd::new(backend.clone(), "ubuntu:focal", "cat", Vec::<String>::new());
    let mut stdin = cmd.stdin_pipe().unwrap();

    cmd.start().await.unwrap();
    stdin.write_all(b"echo\n").await.unwrap();
    stdin.close().await.unwrap();
    stdin.close().await.unwrap();

    cmd.wait().await.unwrap();
    assert_eq!(backend.stdin(), b"echo\n");
}

#[smol_potat::test]
async fn test_wait_closes_unclosed_stdin_pipe() {
    let backend = scripted(Script::exits(0));
    let mut cmd = Cmd::new(backend.clone(), "ubuntu:focal", "cat", Vec::<String>::new());
    let mut stdin = cmd.stdin_pipe().unwrap();

    cmd.start().await.unwrap();
    stdin.write_all(b"partial").await.unwrap();

    cmd.wait().await.unwrap();
    assert_eq!(backend.stdin(), b"partial");
    assert!(stdin.write_all(b"more").await.is_err());
}

#[test]
fn test_cmd_string() {
    let backend = scripted(Script::exits(0));
    let cmd = Cmd::new(backend, "ubuntu:focal", "sh", ["-c", "echo Hello, World!"]);
    assert_eq!(cmd.to_string(), "sh -c echo Hello, World!");
}
