//! Port forwarding endpoint
//!
//! `GET /portForward/{namespace}/{pod}[/{uid}]?port=...` upgrades to a
//! channel WebSocket and forwards every requested port through the
//! configured [`PortForwarder`].

pub mod forwarder;
pub mod options;
pub mod websocket;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, RawQuery, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use tracing::{debug, error, instrument, warn};

use crate::channel::protocol::negotiate;
use crate::error::{Error, Result};
use crate::server::AppState;

pub use forwarder::{ForwardError, ForwardStream, PodRef, PortForwarder, TcpForwarder};
pub use options::PortForwardOptions;
pub use websocket::{handle_websocket_streams, max_ports, PORT_FORWARD_PROTOCOLS};

/// Path parameters of the port-forward routes
#[derive(Debug, Deserialize)]
pub(crate) struct PortForwardPath {
    namespace: String,
    pod: String,
    #[serde(default)]
    uid: Option<String>,
}

/// Upgrade a port-forward request and run the session
///
/// Ports are validated before anything else, so a bad request never opens a
/// stream.
#[instrument(
    skip(state, params, query, headers, ws),
    fields(namespace = %params.namespace, pod = %params.pod)
)]
pub(crate) async fn portforward_handler(
    State(state): State<AppState>,
    Path(params): Path<PortForwardPath>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response> {
    let options = PortForwardOptions::from_query(query.as_deref())?;
    let ws = ws.map_err(|e| Error::BadRequest(format!("unable to upgrade websocket connection: {e}")))?;
    let protocol = negotiate(&headers, &PORT_FORWARD_PROTOCOLS)?;
    let limit = max_ports(protocol.codec);
    if options.ports.len() > limit {
        return Err(Error::BadRequest(format!(
            "too many ports requested for protocol {:?}: {} (at most {limit})",
            protocol.name,
            options.ports.len()
        )));
    }

    let pod = PodRef {
        namespace: params.namespace,
        name: params.pod,
        uid: params.uid,
    };
    debug!(ports = ?options.ports, protocol = protocol.name, "Port forward request accepted");

    let ws = if protocol.name.is_empty() {
        ws
    } else {
        ws.protocols([protocol.name])
    };

    let response = ws
        .on_failed_upgrade(|e| warn!(error = %e, "Port forward upgrade failed"))
        .on_upgrade(move |socket| async move {
            let result = handle_websocket_streams(
                socket,
                protocol,
                options,
                pod.clone(),
                state.forwarder.clone(),
                state.idle_timeout,
                &state.shutdown,
            )
            .await;
            if let Err(e) = result {
                error!(pod = %pod, error = %e, "Port forward session ended with error");
            }
        });
    Ok(response)
}
