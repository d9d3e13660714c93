//! Unit tests for command launching and output forwarding.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tether::process::{parse_command, CommandRunner, Role};
use tether::relay::{LogLine, OutputStream, Relay};
use tether::AppError;

async fn next_line(sub: &mut tether::relay::Subscription) -> LogLine {
    let raw = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("line within timeout")
        .expect("relay open");
    LogLine::decode(&raw).expect("valid frame")
}

#[cfg(unix)]
#[tokio::test]
async fn workspace_env_reaches_command_output() {
    let ct = CancellationToken::new();
    let (relay, _handle) = Relay::spawn(16, ct.clone());
    let mut sub = relay.subscribe().await.expect("subscribe");
    let runner = CommandRunner::new("ws-env", relay);
    let dir = tempfile::tempdir().expect("tempdir");

    let env = BTreeMap::from([("GREETING".to_owned(), "hello".to_owned())]);
    let parsed = parse_command("printenv GREETING").expect("command");
    let mut child = runner
        .spawn(Role::Start, &parsed, dir.path(), &env)
        .expect("spawn");
    assert!(child.wait().await.expect("wait").success());

    let line = next_line(&mut sub).await;
    assert_eq!(line.workspace, "ws-env");
    assert_eq!(line.stream, OutputStream::Stdout);
    assert_eq!(line.message, "hello");
    ct.cancel();
}

#[cfg(unix)]
#[tokio::test]
async fn inline_assignment_overrides_workspace_env() {
    let ct = CancellationToken::new();
    let (relay, _handle) = Relay::spawn(16, ct.clone());
    let mut sub = relay.subscribe().await.expect("subscribe");
    let runner = CommandRunner::new("ws-env", relay);
    let dir = tempfile::tempdir().expect("tempdir");

    let env = BTreeMap::from([("MODE".to_owned(), "workspace".to_owned())]);
    let parsed = parse_command("MODE=inline printenv MODE").expect("command");
    let mut child = runner
        .spawn(Role::Build, &parsed, dir.path(), &env)
        .expect("spawn");
    child.wait().await.expect("wait");

    assert_eq!(next_line(&mut sub).await.message, "inline");
    ct.cancel();
}

#[cfg(unix)]
#[tokio::test]
async fn stderr_is_forwarded_on_stderr_stream() {
    let ct = CancellationToken::new();
    let (relay, _handle) = Relay::spawn(16, ct.clone());
    let mut sub = relay.subscribe().await.expect("subscribe");
    let runner = CommandRunner::new("ws-err", relay);
    let dir = tempfile::tempdir().expect("tempdir");

    let parsed = parse_command("ls definitely-not-here").expect("command");
    let mut child = runner
        .spawn(Role::Test, &parsed, dir.path(), &BTreeMap::new())
        .expect("spawn");
    assert!(!child.wait().await.expect("wait").success());

    let line = next_line(&mut sub).await;
    assert_eq!(line.stream, OutputStream::Stderr);
    assert!(line.message.contains("definitely-not-here"));
    ct.cancel();
}

#[tokio::test]
async fn missing_program_is_process_error() {
    let ct = CancellationToken::new();
    let (relay, _handle) = Relay::spawn(4, ct.clone());
    let runner = CommandRunner::new("ws", relay);
    let dir = tempfile::tempdir().expect("tempdir");

    let parsed = parse_command("tether-no-such-binary --flag").expect("command");
    let err = runner
        .spawn(Role::Start, &parsed, dir.path(), &BTreeMap::new())
        .expect_err("spawn must fail");
    assert!(matches!(err, AppError::Process(ref msg) if msg.contains("start")));
    ct.cancel();
}
