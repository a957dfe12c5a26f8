//! Port-forward sessions over the channel protocol
//!
//! Each requested port gets two consecutive channels: `2i` carries data in
//! both directions and `2i + 1` carries error text to the client. Both start
//! with the port number as a little-endian `u16`. One task per port drives the
//! [`PortForwarder`]; the session ends when every task has finished.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocket;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::forwarder::{ForwardError, PodRef, PortForwarder};
use super::options::PortForwardOptions;
use crate::channel::protocol::{V4_BASE64_PROTOCOL, V4_BINARY_PROTOCOL};
use crate::channel::{ChannelConn, ChannelProtocol, ChannelType, Codec, MAX_INBOUND_BUFFER};
use crate::error::{Error, Result};

/// Sub-protocols accepted for port forwarding
pub const PORT_FORWARD_PROTOCOLS: [ChannelProtocol; 3] = [
    ChannelProtocol {
        name: V4_BINARY_PROTOCOL,
        codec: Codec::Binary,
    },
    ChannelProtocol {
        name: V4_BASE64_PROTOCOL,
        codec: Codec::Base64,
    },
    ChannelProtocol::LEGACY,
];

/// Data and error stream of one forwarded port
#[derive(Debug)]
pub struct StreamPair<S> {
    /// Requested port
    pub port: u16,
    /// Bidirectional data stream
    pub data: S,
    /// Error stream, written only on failure
    pub error: S,
    /// Cancelled when the data stream overflowed its inbound buffer
    pub overflow: CancellationToken,
}

/// Channel types for `ports` forwarded ports
pub fn channel_layout(ports: usize) -> Vec<ChannelType> {
    (0..ports)
        .flat_map(|_| [ChannelType::ReadWrite, ChannelType::Write])
        .collect()
}

/// Most ports a session may forward over `codec`
pub fn max_ports(codec: Codec) -> usize {
    codec.max_channels() / 2
}

/// Group streams opened with [`channel_layout`] into per-port pairs
pub fn pair_streams<S>(ports: &[u16], streams: Vec<S>) -> Vec<StreamPair<S>> {
    let mut streams = streams.into_iter();
    ports
        .iter()
        .map_while(|&port| {
            let data = streams.next()?;
            let error = streams.next()?;
            Some(StreamPair {
                port,
                data,
                error,
                overflow: CancellationToken::new(),
            })
        })
        .collect()
}

/// Serve a port-forward session on an upgraded socket
///
/// Returns [`Error::Cancelled`] when `cancel` fired during the session;
/// per-port failures are reported on the port's error stream, not here.
pub async fn handle_websocket_streams(
    socket: WebSocket,
    protocol: ChannelProtocol,
    options: PortForwardOptions,
    pod: PodRef,
    forwarder: Arc<dyn PortForwarder>,
    idle_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let layout = channel_layout(options.ports.len());
    let (conn, streams) = ChannelConn::open(socket, protocol.codec, &layout, idle_timeout, cancel);
    debug!(
        pod = %pod,
        protocol = protocol.name,
        ports = ?options.ports,
        "Port forward streams open"
    );

    let mut pairs = pair_streams(&options.ports, streams);
    for pair in &mut pairs {
        pair.overflow = pair.data.overflow_token();
    }
    let session = conn.cancel_token().clone();
    let result = forward_streams(forwarder, pod, pairs, session, cancel).await;

    conn.close().await;
    result
}

/// Write port headers and run one forwarding task per pair
///
/// `session` is cancelled when the underlying connection goes away; `caller`
/// is the token of whoever started the session.
pub async fn forward_streams<S>(
    forwarder: Arc<dyn PortForwarder>,
    pod: PodRef,
    mut pairs: Vec<StreamPair<S>>,
    session: CancellationToken,
    caller: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    for pair in &mut pairs {
        let header = pair.port.to_le_bytes();
        if let Err(e) = pair.data.write_all(&header).await {
            error!(port = pair.port, error = %e, "Failed to write port header to data stream");
        }
        if let Err(e) = pair.error.write_all(&header).await {
            error!(port = pair.port, error = %e, "Failed to write port header to error stream");
        }
    }

    let tasks: Vec<_> = pairs
        .into_iter()
        .map(|pair| {
            let port = pair.port;
            let task = tokio::spawn(forward_port(
                forwarder.clone(),
                pod.clone(),
                pair,
                session.clone(),
                caller.clone(),
            ));
            (port, task)
        })
        .collect();

    for (port, task) in tasks {
        if let Err(e) = task.await {
            if e.is_panic() {
                error!(port, pod = %pod, "Port forwarding task panicked");
            } else {
                debug!(port, pod = %pod, error = %e, "Port forwarding task aborted");
            }
        }
    }

    if caller.is_cancelled() {
        return Err(Error::Cancelled);
    }
    debug!(pod = %pod, "Port forward session finished");
    Ok(())
}

async fn forward_port<S>(
    forwarder: Arc<dyn PortForwarder>,
    pod: PodRef,
    pair: StreamPair<S>,
    session: CancellationToken,
    caller: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let StreamPair {
        port,
        mut data,
        mut error,
        overflow,
    } = pair;

    let result = tokio::select! {
        biased;
        _ = session.cancelled() => Err(ForwardError::Other("connection closed".to_string())),
        _ = overflow.cancelled() => Err(ForwardError::Other(format!(
            "client sent more than {MAX_INBOUND_BUFFER} bytes the target did not accept"
        ))),
        result = forwarder.port_forward(&session, &pod, port, &mut data) => result,
    };

    match result {
        Ok(()) => debug!(port, pod = %pod, "Port forwarding finished"),
        Err(e) if caller.is_cancelled() => {
            debug!(port, pod = %pod, error = %e, "Port forwarding cancelled")
        }
        Err(e) => {
            let message = format!("error forwarding port {port} to pod {pod}: {e}");
            error!(port, pod = %pod, error = %e, "Port forwarding failed");
            if let Err(e) = error.write_all(message.as_bytes()).await {
                warn!(port, error = %e, "Failed to write port forwarding error to error stream");
            }
        }
    }

    // Error stream first so the client sees the diagnostic before data EOF
    let _ = error.shutdown().await;
    let _ = data.shutdown().await;
}
