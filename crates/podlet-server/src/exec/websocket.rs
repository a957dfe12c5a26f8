//! Exec sessions over the channel protocol
//!
//! Channels: 0 stdin, 1 stdout, 2 stderr, 3 error, 4 resize. Streams the
//! request did not ask for are ignored. Terminal sizes arrive on the resize
//! channel as a stream of JSON objects.

use std::time::Duration;

use axum::extract::ws::WebSocket;
use podlet_exec::{ContainerExec, ExecContext, Input, Output, TerminalSize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::protocol::{
    BASE64_CHANNEL_PROTOCOL, CHANNEL_PROTOCOL, V4_BASE64_PROTOCOL, V4_BINARY_PROTOCOL,
};
use crate::channel::{ChannelConn, ChannelProtocol, ChannelStream, ChannelType, Codec};
use crate::error::{Error, Result};

use super::options::ExecRequest;

/// Stdin channel
pub const STDIN_CHANNEL: u8 = 0;
/// Stdout channel
pub const STDOUT_CHANNEL: u8 = 1;
/// Stderr channel
pub const STDERR_CHANNEL: u8 = 2;
/// Error/status channel
pub const ERROR_CHANNEL: u8 = 3;
/// Terminal resize channel
pub const RESIZE_CHANNEL: u8 = 4;

/// Sub-protocols accepted for exec
pub const EXEC_PROTOCOLS: [ChannelProtocol; 5] = [
    ChannelProtocol {
        name: V4_BINARY_PROTOCOL,
        codec: Codec::Binary,
    },
    ChannelProtocol {
        name: V4_BASE64_PROTOCOL,
        codec: Codec::Base64,
    },
    ChannelProtocol {
        name: CHANNEL_PROTOCOL,
        codec: Codec::Binary,
    },
    ChannelProtocol {
        name: BASE64_CHANNEL_PROTOCOL,
        codec: Codec::Base64,
    },
    ChannelProtocol::LEGACY,
];

const RESIZE_QUEUE: usize = 8;

/// Container addressed by an exec request
#[derive(Clone, Debug)]
pub struct ExecTarget {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container name
    pub container: String,
}

/// Channel types for an exec request
pub fn channel_layout(request: &ExecRequest) -> [ChannelType; 5] {
    let read = |on: bool| if on { ChannelType::Read } else { ChannelType::Ignore };
    let write = |on: bool| if on { ChannelType::Write } else { ChannelType::Ignore };
    [
        read(request.stdin),
        write(request.stdout),
        write(request.stderr),
        ChannelType::Write,
        read(request.tty),
    ]
}

/// Lowest writable channel, used for the readiness frame
pub fn ready_channel(request: &ExecRequest) -> u8 {
    if request.stdout {
        STDOUT_CHANNEL
    } else if request.stderr {
        STDERR_CHANNEL
    } else {
        ERROR_CHANNEL
    }
}

/// Serve an exec session on an upgraded socket
#[allow(clippy::too_many_arguments)]
pub async fn handle_exec_streams(
    socket: WebSocket,
    protocol: ChannelProtocol,
    request: ExecRequest,
    target: ExecTarget,
    exec: ContainerExec,
    base: ExecContext,
    idle_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let layout = channel_layout(&request);
    let (conn, streams) = ChannelConn::open(socket, protocol.codec, &layout, idle_timeout, cancel);
    let [stdin, stdout, stderr, mut error, resize]: [ChannelStream; 5] = streams
        .try_into()
        .map_err(|_| Error::Internal("unexpected exec channel count".to_string()))?;

    if let Err(e) = conn.send_empty(ready_channel(&request)).await {
        warn!(error = %e, "Failed to send exec readiness frame");
    }

    info!(
        namespace = %target.namespace,
        pod = %target.pod,
        container = %target.container,
        command = %request.command.join(" "),
        tty = request.tty,
        "Exec session started"
    );

    let ctx = base.with_cancel_token(conn.cancel_token().clone());
    let stdin = request.stdin.then(|| Input::reader(stdin));
    let stdout = request.stdout.then(|| Output::writer(stdout));
    let stderr = request.stderr.then(|| Output::writer(stderr));

    let result = if request.tty {
        let (tx, rx) = mpsc::channel(RESIZE_QUEUE);
        tokio::spawn(decode_resize_events(resize, tx));
        let out = stdout
            .clone()
            .unwrap_or_else(|| Output::writer(tokio::io::sink()));
        exec.exec_with_tty(&ctx, &request.command, stdin, out, Some(rx))
            .await
    } else {
        exec.exec(&ctx, &request.command, stdin, stdout.clone(), stderr.clone())
            .await
    };

    for out in stdout.iter().chain(stderr.iter()) {
        let _ = out.shutdown().await;
    }

    match &result {
        Ok(()) => debug!(command = %request.command.join(" "), "Exec finished"),
        Err(e) => debug!(command = %request.command.join(" "), error = %e, "Exec failed"),
    }
    if let Err(e) = write_status(&mut error, protocol, &result).await {
        warn!(error = %e, "Failed to write exec status to error stream");
    }
    let _ = error.shutdown().await;

    conn.close().await;

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Report the outcome of an exec on the error channel
///
/// v4 protocols always receive a `Status` object; older protocols only see
/// the error text on failure.
pub async fn write_status<W>(
    stream: &mut W,
    protocol: ChannelProtocol,
    result: &podlet_exec::Result<()>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if protocol.is_v4() {
        let status = status_json(result);
        stream.write_all(status.to_string().as_bytes()).await?;
    } else if let Err(e) = result {
        stream.write_all(e.to_string().as_bytes()).await?;
    }
    stream.flush().await
}

/// `Status` object describing an exec outcome
pub fn status_json(result: &podlet_exec::Result<()>) -> serde_json::Value {
    match result {
        Ok(()) => serde_json::json!({
            "metadata": {},
            "status": "Success"
        }),
        Err(e) => match e.exit_code() {
            Some(code) => serde_json::json!({
                "metadata": {},
                "status": "Failure",
                "message": format!("command terminated with non-zero exit code: {e}"),
                "reason": "NonZeroExitCode",
                "details": {
                    "causes": [
                        { "reason": "ExitCode", "message": code.to_string() }
                    ]
                }
            }),
            None => serde_json::json!({
                "metadata": {},
                "status": "Failure",
                "message": format!("Internal error occurred: {e}"),
                "reason": "InternalError",
                "details": {
                    "causes": [ { "message": e.to_string() } ]
                },
                "code": 500
            }),
        },
    }
}

/// Decode a stream of JSON terminal sizes and forward them
///
/// Stops at end of stream, on malformed input or when the receiver is gone.
pub async fn decode_resize_events<R>(mut reader: R, tx: mpsc::Sender<TerminalSize>)
where
    R: AsyncRead + Unpin,
{
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);

        let mut sizes = Vec::new();
        let mut malformed = None;
        let consumed = {
            let mut stream = serde_json::Deserializer::from_slice(&pending).into_iter::<TerminalSize>();
            let mut consumed = 0;
            loop {
                match stream.next() {
                    Some(Ok(size)) => {
                        sizes.push(size);
                        consumed = stream.byte_offset();
                    }
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => {
                        malformed = Some(e);
                        break;
                    }
                    None => {
                        consumed = stream.byte_offset();
                        break;
                    }
                }
            }
            consumed
        };
        pending.drain(..consumed);

        for size in sizes {
            debug!(width = size.width, height = size.height, "Terminal resize");
            if tx.send(size).await.is_err() {
                return;
            }
        }
        if let Some(e) = malformed {
            warn!(error = %e, "Malformed terminal resize event, ignoring further resizes");
            return;
        }
    }
}
