//! podlet streaming server
//!
//! Serves the interactive endpoints of a node agent for simulated pods:
//! kubectl exec and port-forward over the `channel.k8s.io` WebSocket family.
//!
//! # Architecture
//!
//! ```text
//! kubectl ──► router ──► exec handler ──────► ChannelConn ──► ContainerExec
//!                   └──► portforward handler ─► ChannelConn ──► PortForwarder
//! ```
//!
//! # Endpoints
//!
//! - `GET /portForward/{namespace}/{pod}[/{uid}]?port=...`
//! - `GET /exec/{namespace}/{pod}[/{uid}]/{container}?command=...`
//! - `GET /healthz`

#![deny(missing_docs)]

pub mod channel;
pub mod config;
pub mod error;
pub mod exec;
pub mod portforward;
pub mod server;
pub mod telemetry;

pub use channel::{ChannelConn, ChannelProtocol, ChannelStream, ChannelType, Codec};
pub use config::{Cli, LogFormat, ServerConfig};
pub use error::{Error, Result};
pub use portforward::{ForwardError, PodRef, PortForwarder, TcpForwarder};
pub use server::{router, start_server, AppState};
