use std::time::Duration;

use helmsman_exec::*;
use serde::Deserialize;
use tokio::time::timeout;

fn cmd<const N: usize>(argv: [&str; N]) -> Command {
    Command::new(argv, CommandOptions::default()).unwrap()
}

#[tokio::test]
async fn test_echo_succeeds() {
    let server = Server::localhost();
    let exited = server.execute(cmd(["echo", "hi"])).await.unwrap().await.unwrap();
    assert_eq!(exited.stdout(), "hi\n");
    assert_eq!(exited.exit_code(), Some(0));
    assert!(!exited.failed());
    assert_eq!(exited.host(), "localhost");
}

#[tokio::test]
async fn test_false_fails_by_default() {
    let server = Server::localhost();
    let err = server.execute(cmd(["false"])).await.unwrap().await.unwrap_err();
    assert!(matches!(err, ProcessError::NonZeroExit { exit_code: 1, .. }));
    assert_eq!(err.to_string(), "localhost: false: exited with code 1");
}

#[tokio::test]
async fn test_allow_failure_returns_result() {
    let server = Server::localhost();
    let mut process = server.execute(cmd(["false"])).await.unwrap();
    process.allow_failure();
    let exited = process.await.unwrap();
    assert!(exited.failed());
    assert_eq!(exited.exit_code(), Some(1));
}

#[tokio::test]
async fn test_exit_code_carried_in_error() {
    let server = Server::localhost();
    let err = server
        .run(cmd(["sh", "-c", "echo broken >&2; exit 3"]), ExitPolicy::FailOnNonZero)
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), Some(3));
    assert!(err.to_string().contains("broken (3)"));
}

#[tokio::test]
async fn test_missing_binary_is_not_found() {
    let server = Server::localhost();
    let err = server
        .execute(cmd(["/nonexistent/helmsman-missing"]))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().starts_with("localhost: "));
}

#[tokio::test]
async fn test_input_delivered_in_order() {
    let server = Server::localhost();
    let mut process = server.execute(cmd(["cat"])).await.unwrap();
    process.input("a").unwrap().input(b"b").unwrap();
    assert_eq!(process.output().await.unwrap(), "ab");
}

#[tokio::test]
async fn test_input_after_close_rejected() {
    let server = Server::localhost();
    let mut process = server.execute(cmd(["cat"])).await.unwrap();
    process.close_stdin().close_stdin();
    assert!(process.input("late").is_err());
    process.wait().await.unwrap();
}

#[tokio::test]
async fn test_prepared_process_delivers_queued_input() {
    let server = Server::localhost();
    let mut process = server.prepare(cmd(["cat"])).with_input("queued").unwrap();
    assert_eq!(process.state(), ProcessState::Created);
    process.start().await.unwrap();
    assert_eq!(process.output().await.unwrap(), "queued");
    assert_eq!(process.state(), ProcessState::Succeeded);
}

#[tokio::test]
async fn test_repeated_wait_same_outcome() {
    let server = Server::localhost();
    let mut process = server.execute(cmd(["sh", "-c", "exit 4"])).await.unwrap();
    let first = process.wait().await.unwrap_err();
    let second = process.wait().await.unwrap_err();
    assert_eq!(first, second);
    assert_eq!(process.state(), ProcessState::Failed);
}

#[tokio::test]
async fn test_kill_resolves_wait() {
    let server = Server::localhost();
    let mut process = server.execute(cmd(["sleep", "30"])).await.unwrap();
    process.kill(Signal::Term);
    assert_eq!(process.state(), ProcessState::Killed);
    assert!(process.input("x").is_err());

    let result = timeout(Duration::from_secs(5), process.wait()).await.unwrap();
    assert!(matches!(result, Err(ProcessError::Failed { .. })));
    assert_eq!(process.state(), ProcessState::Killed);
}

#[tokio::test]
async fn test_ignored_signal_is_forced() {
    let server = Server::localhost();
    let mut process = server
        .execute(cmd(["sh", "-c", "trap '' TERM; exec sleep 30"]))
        .await
        .unwrap();
    process.allow_failure();
    // give the shell time to install the trap
    tokio::time::sleep(Duration::from_millis(200)).await;
    process.terminate();

    let exited = timeout(Duration::from_secs(10), process.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exited.signal(), Some("KILL"));
}

#[tokio::test]
async fn test_kill_while_input_is_unread() {
    let server = Server::localhost();
    let mut process = server.execute(cmd(["sleep", "1000"])).await.unwrap();
    process.allow_failure();
    // far more than a pipe buffer; sleep never reads it
    process.input(vec![b'x'; 1 << 20]).unwrap();
    process.close_stdin();
    tokio::time::sleep(Duration::from_millis(200)).await;

    process.kill(Signal::Kill);
    let exited = timeout(Duration::from_secs(10), process.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exited.signal(), Some("KILL"));
    assert_eq!(process.state(), ProcessState::Killed);
}

#[tokio::test]
async fn test_output_flows_while_input_is_pending() {
    let server = Server::localhost();
    let mut process = server.prepare(cmd(["sh", "-c", "echo ready; sleep 30"]));
    let mut output = process.stream().unwrap();
    process.input(vec![b'x'; 1 << 20]).unwrap();
    process.start().await.unwrap();

    let chunk = timeout(Duration::from_secs(5), output.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chunk, b"ready\n");
    process.kill(Signal::Kill);
}

#[tokio::test]
async fn test_kill_from_other_task() {
    let server = Server::localhost();
    let mut process = server.execute(cmd(["sleep", "30"])).await.unwrap();
    process.allow_failure();
    let killer = process.killer();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        killer.kill(Signal::Kill);
    });

    let exited = timeout(Duration::from_secs(5), process.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exited.signal(), Some("KILL"));
}

#[tokio::test]
async fn test_kill_before_start() {
    let server = Server::localhost();
    let mut process = server.prepare(cmd(["sleep", "30"]));
    process.kill(Signal::Term);
    process.start().await.unwrap();
    let result = timeout(Duration::from_secs(1), process.wait()).await.unwrap();
    assert!(result.is_err());
    assert_eq!(process.state(), ProcessState::Killed);
}

#[tokio::test]
async fn test_timeout_race() {
    let server = Server::localhost();
    let mut process = server.execute(cmd(["sleep", "30"])).await.unwrap();
    let killer = process.killer();
    if timeout(Duration::from_millis(100), process.wait()).await.is_err() {
        killer.kill(Signal::Term);
    }
    let result = timeout(Duration::from_secs(5), process.wait()).await.unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_stream_forwards_stdout() {
    let server = Server::localhost();
    let mut process = server.prepare(cmd(["sh", "-c", "echo one; echo two"]));
    let mut rx = process.stream().unwrap();
    process.start().await.unwrap();
    let exited = process.await.unwrap();
    assert_eq!(exited.stdout(), "");

    let mut streamed = Vec::new();
    while let Some(chunk) = rx.recv().await {
        streamed.extend(chunk);
    }
    assert_eq!(streamed, b"one\ntwo\n");
}

#[tokio::test]
async fn test_directory_and_environment() {
    let server = Server::localhost();
    let options = CommandOptions::default().directory("/").env("GREETING", "hello");
    let command = Command::new(["sh", "-c", "pwd; echo $GREETING"], options).unwrap();
    let output = server.execute(command).await.unwrap().output().await.unwrap();
    assert_eq!(output, "/\nhello\n");
}

#[tokio::test]
async fn test_bash_sentinel() {
    let server = Server::localhost();
    let command = Command::bash(r#"echo "$0 $1""#, ["first"], CommandOptions::default()).unwrap();
    assert_eq!(command.name(), "HelmsmanBashCommand");
    let output = server.execute(command).await.unwrap().output().await.unwrap();
    assert_eq!(output, "HelmsmanBashCommand first\n");
}

#[tokio::test]
async fn test_stdout_and_json_combinators() {
    #[derive(Deserialize)]
    struct Answer {
        value: u32,
    }

    let server = Server::localhost();
    let text = server
        .run(cmd(["printf", "%s", "plain"]), ExitPolicy::FailOnNonZero)
        .stdout()
        .await
        .unwrap();
    assert_eq!(text, "plain");

    let answer: Answer = server
        .run(cmd(["echo", r#"{"value": 42}"#]), ExitPolicy::FailOnNonZero)
        .json()
        .await
        .unwrap();
    assert_eq!(answer.value, 42);

    let err = server
        .run(cmd(["echo", "not json"]), ExitPolicy::FailOnNonZero)
        .json::<Answer>()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Parsing(_)));
}

#[tokio::test]
async fn test_unwrap_process() {
    let server = Server::localhost();
    let process = server.execute(cmd(["true"])).await.unwrap();
    let exited = unwrap(process).await.unwrap();
    assert!(exited.succeeded());

    let process = server.execute(cmd(["false"])).await.unwrap();
    let report = unwrap(process).await.unwrap_err();
    assert!(report.downcast_ref::<ProcessError>().is_some());
}

#[tokio::test]
async fn test_state_watch() {
    let server = Server::localhost();
    let process = server.execute(cmd(["true"])).await.unwrap();
    let mut states = process.subscribe();
    let exited = process.await.unwrap();
    assert!(exited.succeeded());
    states.wait_for(|s| s.is_terminal()).await.unwrap();
    assert_eq!(*states.borrow(), ProcessState::Succeeded);
}
