//! Port-forward targets
//!
//! A [`PortForwarder`] receives the data stream of one forwarded port and
//! bridges it to wherever the pod's port lives. The multiplexer makes one
//! call per requested port, concurrently, and closes the streams once the
//! call returns.

use std::collections::HashMap;
use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Pod addressed by a port-forward request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodRef {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Pod UID, when the request pinned one
    pub uid: Option<String>,
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Bidirectional byte stream handed to a forwarder
pub trait ForwardStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ForwardStream for T {}

/// Errors a forwarder reports for one port
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// No target is configured for the port
    #[error("no forwarding target for port {0}")]
    NoTarget(u16),

    /// The target could not be reached
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Target address
        addr: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// I/O error while copying
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Any other forwarder-specific failure
    #[error("{0}")]
    Other(String),
}

/// Target for forwarded port streams
///
/// Implementations block (await) until the session for the port is over,
/// use only the stream they are given and do not keep it after returning.
#[async_trait::async_trait]
pub trait PortForwarder: Send + Sync {
    /// Forward `stream` to `port` of `pod`
    async fn port_forward(
        &self,
        cancel: &CancellationToken,
        pod: &PodRef,
        port: u16,
        stream: &mut dyn ForwardStream,
    ) -> Result<(), ForwardError>;
}

/// Forwards ports to TCP addresses
///
/// A port resolves to its explicitly configured address, or to
/// `<default_host>:<port>` when a default host is set. The port session ends
/// when the target closes its side; a client half-close only ends the
/// client-to-target direction.
#[derive(Clone, Debug, Default)]
pub struct TcpForwarder {
    targets: HashMap<u16, String>,
    default_host: Option<String>,
}

impl TcpForwarder {
    /// Create a forwarder with explicit per-port targets
    pub fn new(targets: HashMap<u16, String>, default_host: Option<String>) -> Self {
        Self {
            targets,
            default_host,
        }
    }

    /// Address a port is forwarded to
    pub fn target(&self, port: u16) -> Option<String> {
        self.targets
            .get(&port)
            .cloned()
            .or_else(|| self.default_host.as_ref().map(|host| format_addr(host, port)))
    }
}

fn format_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[async_trait::async_trait]
impl PortForwarder for TcpForwarder {
    async fn port_forward(
        &self,
        cancel: &CancellationToken,
        pod: &PodRef,
        port: u16,
        stream: &mut dyn ForwardStream,
    ) -> Result<(), ForwardError> {
        let addr = self.target(port).ok_or(ForwardError::NoTarget(port))?;
        let mut upstream = TcpStream::connect(&addr)
            .await
            .map_err(|source| ForwardError::Connect {
                addr: addr.clone(),
                source,
            })?;
        debug!(pod = %pod, port, addr = %addr, "Connected forwarding target");

        let (mut client_read, mut client_write) = tokio::io::split(stream);
        let (mut upstream_read, mut upstream_write) = upstream.split();

        let to_upstream = async {
            let sent = tokio::io::copy(&mut client_read, &mut upstream_write).await?;
            upstream_write.shutdown().await?;
            Ok::<u64, io::Error>(sent)
        };
        let from_upstream = async {
            let received = tokio::io::copy(&mut upstream_read, &mut client_write).await?;
            client_write.shutdown().await?;
            Ok::<u64, io::Error>(received)
        };
        tokio::pin!(to_upstream, from_upstream);

        let mut sent = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = &mut to_upstream, if sent.is_none() => {
                    sent = Some(result?);
                    debug!(pod = %pod, port, "Client finished sending");
                }
                result = &mut from_upstream => {
                    let received = result?;
                    debug!(pod = %pod, port, sent = ?sent, received, "Forwarding finished");
                    return Ok(());
                }
            }
        }
    }
}
