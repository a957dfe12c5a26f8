//! Shared test helpers: server startup, WebSocket client, frame decoding

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use futures::{SinkExt, StreamExt};
use podlet_exec::{ContainerExec, ExecContext, PtyCapability};
use podlet_server::{router, AppState, TcpForwarder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound for any single wait in these tests
pub const WAIT: Duration = Duration::from_secs(10);

/// State with the given forwarder, a plain exec adapter and no exec overlay
pub fn state(forwarder: TcpForwarder, idle_timeout: Duration) -> AppState {
    AppState {
        forwarder: Arc::new(forwarder),
        exec: ContainerExec::with_capability(PtyCapability::Unavailable),
        exec_context: ExecContext::default(),
        idle_timeout,
        shutdown: CancellationToken::new(),
    }
}

/// Serve the router on a loopback port
pub async fn serve(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router(state)).await });
    addr
}

/// TCP server that echoes every byte back
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// TCP server that accepts connections and never reads from them
pub async fn stalled_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

/// Open a WebSocket, optionally offering one sub-protocol
pub async fn connect(
    addr: SocketAddr,
    path: &str,
    protocol: Option<&str>,
) -> Result<WsClient, tokio_tungstenite::tungstenite::Error> {
    let mut request = format!("ws://{addr}{path}").into_client_request()?;
    if let Some(protocol) = protocol {
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_str(protocol).unwrap());
    }
    let (ws, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

/// HTTP status of a rejected upgrade
pub async fn rejected_status(addr: SocketAddr, path: &str, protocol: Option<&str>) -> u16 {
    match connect(addr, path, protocol).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => response.status().as_u16(),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("upgrade unexpectedly succeeded"),
    }
}

/// Split a received message into channel and payload
pub fn decode(msg: &Message) -> Option<(u8, Vec<u8>)> {
    match msg {
        Message::Binary(data) => {
            let (&channel, payload) = data.split_first()?;
            Some((channel, payload.to_vec()))
        }
        Message::Text(text) => {
            let (prefix, payload) = text.as_str().split_at(1);
            let channel = prefix.as_bytes()[0] - b'0';
            Some((channel, STANDARD.decode(payload).unwrap()))
        }
        _ => None,
    }
}

/// Send a payload on a channel using the binary codec
pub async fn send_binary(ws: &mut WsClient, channel: u8, data: &[u8]) {
    let mut frame = vec![channel];
    frame.extend_from_slice(data);
    ws.send(Message::Binary(frame.into())).await.unwrap();
}

/// Send a payload on a channel using the base64 codec
pub async fn send_base64(ws: &mut WsClient, channel: u8, data: &[u8]) {
    let frame = format!("{}{}", char::from(b'0' + channel), STANDARD.encode(data));
    ws.send(Message::Text(frame.into())).await.unwrap();
}

/// Bytes received so far, per channel, plus the raw frame order
#[derive(Debug, Default)]
pub struct Received {
    pub channels: HashMap<u8, Vec<u8>>,
    pub frames: Vec<(u8, usize)>,
    pub closed: bool,
}

impl Received {
    pub fn channel(&self, channel: u8) -> &[u8] {
        self.channels.get(&channel).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn text(&self, channel: u8) -> String {
        String::from_utf8_lossy(self.channel(channel)).into_owned()
    }
}

/// Read frames until `done` holds or the server closes the connection
pub async fn read_until<F>(ws: &mut WsClient, received: &mut Received, done: F)
where
    F: Fn(&Received) -> bool,
{
    while !done(received) {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for frames");
        match msg {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                received.closed = true;
                return;
            }
            Some(Ok(msg)) => {
                if let Some((channel, payload)) = decode(&msg) {
                    received.frames.push((channel, payload.len()));
                    received
                        .channels
                        .entry(channel)
                        .or_default()
                        .extend_from_slice(&payload);
                }
            }
        }
    }
}

/// Read every frame until the server closes the connection
pub async fn read_to_close(ws: &mut WsClient) -> Received {
    let mut received = Received::default();
    read_until(ws, &mut received, |r| r.closed).await;
    received
}
