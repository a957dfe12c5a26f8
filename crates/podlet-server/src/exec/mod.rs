//! Container exec endpoint
//!
//! `/exec/{namespace}/{pod}[/{uid}]/{container}?command=...` runs the command
//! as a local process and streams its stdio over the channel protocol.

pub mod options;
pub mod websocket;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, RawQuery, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use tracing::{error, instrument, warn};

use crate::channel::protocol::negotiate;
use crate::error::{Error, Result};
use crate::server::AppState;

pub use options::ExecRequest;
pub use websocket::{handle_exec_streams, ExecTarget, EXEC_PROTOCOLS};

/// Path parameters of the exec routes
#[derive(Debug, Deserialize)]
pub(crate) struct ExecPath {
    namespace: String,
    pod: String,
    #[serde(default)]
    uid: Option<String>,
    container: String,
}

/// Upgrade an exec request and run the command
#[instrument(
    skip(state, params, query, headers, ws),
    fields(
        namespace = %params.namespace,
        pod = %params.pod,
        uid = ?params.uid,
        container = %params.container
    )
)]
pub(crate) async fn exec_handler(
    State(state): State<AppState>,
    Path(params): Path<ExecPath>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response> {
    let request = ExecRequest::from_query(query.as_deref())?;
    let ws = ws.map_err(|e| Error::BadRequest(format!("unable to upgrade websocket connection: {e}")))?;
    let protocol = negotiate(&headers, &EXEC_PROTOCOLS)?;

    let target = ExecTarget {
        namespace: params.namespace,
        pod: params.pod,
        container: params.container,
    };

    let ws = if protocol.name.is_empty() {
        ws
    } else {
        ws.protocols([protocol.name])
    };

    let response = ws
        .on_failed_upgrade(|e| warn!(error = %e, "Exec upgrade failed"))
        .on_upgrade(move |socket| async move {
            let result = handle_exec_streams(
                socket,
                protocol,
                request,
                target.clone(),
                state.exec,
                state.exec_context.clone(),
                state.idle_timeout,
                &state.shutdown,
            )
            .await;
            if let Err(e) = result {
                error!(
                    namespace = %target.namespace,
                    pod = %target.pod,
                    container = %target.container,
                    error = %e,
                    "Exec session ended with error"
                );
            }
        });
    Ok(response)
}
