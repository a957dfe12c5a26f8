//! Port-forward stories

use std::collections::HashMap;
use std::time::Duration;

use podlet_server::TcpForwarder;

use super::helpers::{
    connect, echo_server, read_to_close, read_until, rejected_status, send_base64, send_binary,
    serve, stalled_server, state, Received, WAIT,
};

const PATH: &str = "/portForward/default/web-0";

fn headers_received(received: &Received, channels: u8) -> bool {
    (0..channels).all(|c| received.channel(c).len() >= 2)
}

#[tokio::test]
async fn test_two_ports_get_headers_and_independent_streams() {
    let echo = echo_server().await;
    let forwarder = TcpForwarder::new(
        HashMap::from([(8080, echo.to_string()), (9090, echo.to_string())]),
        None,
    );
    let addr = serve(state(forwarder, WAIT)).await;

    let mut ws = connect(addr, &format!("{PATH}?port=8080&port=9090"), Some("v4.channel.k8s.io"))
        .await
        .unwrap();

    let mut received = Received::default();
    read_until(&mut ws, &mut received, |r| headers_received(r, 4)).await;
    assert_eq!(received.channel(0), 8080u16.to_le_bytes());
    assert_eq!(received.channel(1), 8080u16.to_le_bytes());
    assert_eq!(received.channel(2), 9090u16.to_le_bytes());
    assert_eq!(received.channel(3), 9090u16.to_le_bytes());

    send_binary(&mut ws, 0, b"to-8080").await;
    send_binary(&mut ws, 2, b"to-9090").await;
    read_until(&mut ws, &mut received, |r| {
        r.channel(0).len() >= 2 + 7 && r.channel(2).len() >= 2 + 7
    })
    .await;
    assert_eq!(&received.channel(0)[2..], b"to-8080");
    assert_eq!(&received.channel(2)[2..], b"to-9090");

    // Nothing but headers on the error streams of healthy ports
    assert_eq!(received.channel(1).len(), 2);
    assert_eq!(received.channel(3).len(), 2);

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_failing_port_reports_on_its_error_stream_only() {
    let echo = echo_server().await;
    // 7000 has no target and fails; 7001 works
    let forwarder = TcpForwarder::new(HashMap::from([(7001, echo.to_string())]), None);
    let addr = serve(state(forwarder, WAIT)).await;

    let mut ws = connect(addr, &format!("{PATH}?port=7000,7001"), Some("v4.channel.k8s.io"))
        .await
        .unwrap();

    let expected = "error forwarding port 7000 to pod default/web-0: no forwarding target for port 7000";
    let mut received = Received::default();
    read_until(&mut ws, &mut received, |r| {
        headers_received(r, 4) && r.channel(1).len() >= 2 + expected.len()
    })
    .await;
    assert_eq!(&received.channel(1)[..2], 7000u16.to_le_bytes());
    assert_eq!(String::from_utf8_lossy(&received.channel(1)[2..]), expected);

    send_binary(&mut ws, 2, b"still alive").await;
    read_until(&mut ws, &mut received, |r| r.channel(2).len() >= 2 + 11).await;
    assert_eq!(&received.channel(2)[2..], b"still alive");
    assert_eq!(received.channel(3).len(), 2);

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_base64_protocol() {
    let echo = echo_server().await;
    let forwarder = TcpForwarder::new(HashMap::new(), Some(echo.ip().to_string()));
    let addr = serve(state(forwarder, WAIT)).await;
    let port = echo.port();

    let mut ws = connect(
        addr,
        &format!("{PATH}?port={port}"),
        Some("v4.base64.channel.k8s.io"),
    )
    .await
    .unwrap();

    let mut received = Received::default();
    read_until(&mut ws, &mut received, |r| headers_received(r, 2)).await;
    assert_eq!(received.channel(0), port.to_le_bytes());

    send_base64(&mut ws, 0, &[0u8, 159, 255]).await;
    read_until(&mut ws, &mut received, |r| r.channel(0).len() >= 5).await;
    assert_eq!(&received.channel(0)[2..], [0u8, 159, 255]);

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_legacy_client_without_protocol() {
    let echo = echo_server().await;
    let forwarder = TcpForwarder::new(HashMap::from([(80, echo.to_string())]), None);
    let addr = serve(state(forwarder, WAIT)).await;

    let mut ws = connect(addr, &format!("{PATH}/1234-uid?port=80"), None)
        .await
        .unwrap();

    let mut received = Received::default();
    read_until(&mut ws, &mut received, |r| headers_received(r, 2)).await;
    assert_eq!(received.channel(0), 80u16.to_le_bytes());
    assert_eq!(received.channel(1), 80u16.to_le_bytes());

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_invalid_ports_are_rejected_before_upgrade() {
    let addr = serve(state(TcpForwarder::default(), WAIT)).await;

    for query in ["", "?port=", "?port=abc", "?port=0", "?port=70000", "?port=80,"] {
        let status = rejected_status(addr, &format!("{PATH}{query}"), Some("v4.channel.k8s.io")).await;
        assert_eq!(status, 400, "query {query:?}");
    }
}

#[tokio::test]
async fn test_unsupported_protocol_is_rejected() {
    let addr = serve(state(TcpForwarder::default(), WAIT)).await;
    let status = rejected_status(addr, &format!("{PATH}?port=80"), Some("SPDY/3.1")).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_base64_port_limit() {
    let addr = serve(state(TcpForwarder::default(), WAIT)).await;
    let ports = |n: u16| (1..=n).map(|p| p.to_string()).collect::<Vec<_>>().join(",");

    let status = rejected_status(
        addr,
        &format!("{PATH}?port={}", ports(41)),
        Some("v4.base64.channel.k8s.io"),
    )
    .await;
    assert_eq!(status, 400);

    // The binary codec addresses every channel of the same request
    let mut ws = connect(addr, &format!("{PATH}?port={}", ports(41)), Some("v4.channel.k8s.io"))
        .await
        .unwrap();
    let mut received = Received::default();
    read_until(&mut ws, &mut received, |r| headers_received(r, 82)).await;
    assert_eq!(received.channel(80), 41u16.to_le_bytes());

    // 40 ports is the most base64 can carry; the last error channel is 79
    let mut ws = connect(
        addr,
        &format!("{PATH}?port={}", ports(40)),
        Some("v4.base64.channel.k8s.io"),
    )
    .await
    .unwrap();
    let mut received = Received::default();
    read_until(&mut ws, &mut received, |r| headers_received(r, 80)).await;
    assert_eq!(&received.channel(79)[..2], 40u16.to_le_bytes());
}

#[tokio::test]
async fn test_stalled_target_fails_only_its_port() {
    let stalled = stalled_server().await;
    let echo = echo_server().await;
    let forwarder = TcpForwarder::new(
        HashMap::from([(5000, stalled.to_string()), (5001, echo.to_string())]),
        None,
    );
    let addr = serve(state(forwarder, WAIT)).await;

    let mut ws = connect(addr, &format!("{PATH}?port=5000,5001"), Some("v4.channel.k8s.io"))
        .await
        .unwrap();
    let mut received = Received::default();
    read_until(&mut ws, &mut received, |r| headers_received(r, 4)).await;

    // Far more than socket buffers, the pipe and the inbound limit together
    let chunk = vec![b'x'; 64 * 1024];
    for _ in 0..512 {
        send_binary(&mut ws, 0, &chunk).await;
    }

    let expected = "error forwarding port 5000 to pod default/web-0: client sent more than";
    read_until(&mut ws, &mut received, |r| r.channel(1).len() >= 2 + expected.len()).await;
    let diagnostic = String::from_utf8_lossy(&received.channel(1)[2..]).into_owned();
    assert!(diagnostic.starts_with(expected), "{diagnostic}");

    send_binary(&mut ws, 2, b"ok").await;
    read_until(&mut ws, &mut received, |r| r.channel(2).len() >= 4).await;
    assert_eq!(&received.channel(2)[2..], b"ok");
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let echo = echo_server().await;
    let forwarder = TcpForwarder::new(HashMap::from([(80, echo.to_string())]), None);
    let addr = serve(state(forwarder, Duration::from_secs(1))).await;

    let mut ws = connect(addr, &format!("{PATH}?port=80"), Some("v4.channel.k8s.io"))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let received = read_to_close(&mut ws).await;
    assert!(received.closed);
    assert!(started.elapsed() < WAIT);
    assert_eq!(received.channel(0), 80u16.to_le_bytes());
}
