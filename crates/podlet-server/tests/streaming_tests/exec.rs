//! Exec stories

use podlet_server::TcpForwarder;

use super::helpers::{connect, read_to_close, rejected_status, send_binary, serve, state, WAIT};

const PATH: &str = "/exec/default/web-0/app";

fn query(command: &[&str], flags: &str) -> String {
    let command: Vec<String> = command
        .iter()
        .map(|arg| {
            let encoded: String = url::form_urlencoded::byte_serialize(arg.as_bytes()).collect();
            format!("command={encoded}")
        })
        .collect();
    format!("{PATH}?{}&{flags}", command.join("&"))
}

fn status(received: &super::helpers::Received) -> serde_json::Value {
    serde_json::from_slice(received.channel(3)).expect("status JSON on error channel")
}

#[tokio::test]
async fn test_exec_streams_stdout_and_reports_success() {
    let addr = serve(state(TcpForwarder::default(), WAIT)).await;
    let mut ws = connect(
        addr,
        &query(&["sh", "-c", "echo hello"], "stdout=1"),
        Some("v4.channel.k8s.io"),
    )
    .await
    .unwrap();

    let received = read_to_close(&mut ws).await;

    // Readiness frame comes first, empty, on stdout
    assert_eq!(received.frames.first(), Some(&(1, 0)));
    assert_eq!(received.text(1), "hello\n");
    assert_eq!(status(&received)["status"], "Success");
}

#[tokio::test]
async fn test_exec_non_zero_exit_status() {
    let addr = serve(state(TcpForwarder::default(), WAIT)).await;
    let mut ws = connect(
        addr,
        &query(&["sh", "-c", "echo oops >&2; exit 3"], "stdout=1&stderr=1"),
        Some("v4.channel.k8s.io"),
    )
    .await
    .unwrap();

    let received = read_to_close(&mut ws).await;
    assert_eq!(received.text(2), "oops\n");

    let status = status(&received);
    assert_eq!(status["status"], "Failure");
    assert_eq!(status["reason"], "NonZeroExitCode");
    assert_eq!(status["details"]["causes"][0]["reason"], "ExitCode");
    assert_eq!(status["details"]["causes"][0]["message"], "3");
}

#[tokio::test]
async fn test_exec_reads_stdin() {
    let addr = serve(state(TcpForwarder::default(), WAIT)).await;
    let mut ws = connect(
        addr,
        &query(&["head", "-n", "1"], "stdin=1&stdout=1"),
        Some("v4.channel.k8s.io"),
    )
    .await
    .unwrap();

    send_binary(&mut ws, 0, b"first line\nsecond").await;
    let received = read_to_close(&mut ws).await;
    assert_eq!(received.text(1), "first line\n");
    assert_eq!(status(&received)["status"], "Success");
}

#[tokio::test]
async fn test_exec_legacy_protocol_writes_error_text_only_on_failure() {
    let addr = serve(state(TcpForwarder::default(), WAIT)).await;

    let mut ws = connect(addr, &query(&["true"], "stdout=1"), Some("channel.k8s.io"))
        .await
        .unwrap();
    let received = read_to_close(&mut ws).await;
    assert!(received.channel(3).is_empty());

    let mut ws = connect(
        addr,
        &query(&["sh", "-c", "exit 2"], "stdout=1"),
        Some("channel.k8s.io"),
    )
    .await
    .unwrap();
    let received = read_to_close(&mut ws).await;
    let text = received.text(3);
    assert!(text.starts_with("cmd wait: sh -c exit 2:"), "{text}");
}

#[tokio::test]
async fn test_exec_tty_without_pty_support_merges_output() {
    // The test state reports no pseudo-terminal support
    let addr = serve(state(TcpForwarder::default(), WAIT)).await;
    let mut ws = connect(
        addr,
        &query(&["sh", "-c", "echo out; echo err >&2"], "stdout=1&stderr=1&tty=1"),
        Some("v4.base64.channel.k8s.io"),
    )
    .await
    .unwrap();

    let received = read_to_close(&mut ws).await;
    let output = received.text(1);
    assert!(output.contains("out\n"), "{output}");
    assert!(output.contains("err\n"), "{output}");
    // tty turns the separate stderr stream off
    assert!(received.channel(2).is_empty());
    assert_eq!(status(&received)["status"], "Success");
}

#[tokio::test]
async fn test_exec_requires_command_and_stream() {
    let addr = serve(state(TcpForwarder::default(), WAIT)).await;

    let status = rejected_status(addr, &format!("{PATH}?stdout=1"), Some("v4.channel.k8s.io")).await;
    assert_eq!(status, 400);

    let status = rejected_status(addr, &query(&["ls"], "stdout=0"), Some("v4.channel.k8s.io")).await;
    assert_eq!(status, 400);
}
