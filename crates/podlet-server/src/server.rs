//! Streaming server

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use podlet_exec::{ContainerExec, ExecContext};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::exec::exec_handler;
use crate::portforward::{portforward_handler, PortForwarder, TcpForwarder};

/// How long in-flight requests get to finish after shutdown starts
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Target for port-forward streams
    pub forwarder: Arc<dyn PortForwarder>,
    /// Exec adapter
    pub exec: ContainerExec,
    /// Base context for exec commands (working directory, environment)
    pub exec_context: ExecContext,
    /// Idle timeout for streaming connections
    pub idle_timeout: Duration,
    /// Cancelled when the server shuts down; parent of every session
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build state from configuration
    pub fn from_config(config: &ServerConfig, shutdown: CancellationToken) -> Self {
        let forwarder = TcpForwarder::new(
            config.forward_targets.clone(),
            config.forward_default_host.clone(),
        );
        let mut exec_context = ExecContext::new(shutdown.clone()).with_env(config.exec_env.clone());
        if let Some(dir) = &config.exec_dir {
            exec_context = exec_context.with_dir(dir.clone());
        }

        Self {
            forwarder: Arc::new(forwarder),
            exec: ContainerExec::detect(),
            exec_context,
            idle_timeout: config.idle_timeout,
            shutdown,
        }
    }
}

/// Kubelet-style streaming routes
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/healthz", get(|| async { "ok" }))
        .route("/portForward/{namespace}/{pod}", get(portforward_handler))
        .route("/portForward/{namespace}/{pod}/{uid}", get(portforward_handler))
        // kubectl upgrades exec with GET; POST is the SPDY flavour and fails the upgrade
        .route(
            "/exec/{namespace}/{pod}/{container}",
            get(exec_handler).post(exec_handler),
        )
        .route(
            "/exec/{namespace}/{pod}/{uid}/{container}",
            get(exec_handler).post(exec_handler),
        )
        .with_state(state)
}

/// Run the server until `shutdown` is cancelled
pub async fn start_server(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let state = AppState::from_config(&config, shutdown.clone());
    info!(pty = ?state.exec.capability(), "Exec adapter ready");
    let app = router(state);

    let handle = Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        let shutdown = shutdown.clone();
        async move {
            shutdown.cancelled().await;
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        }
    });

    let served = match &config.tls {
        Some(tls) => {
            let tls_config = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
                .await
                .map_err(|e| Error::Config(format!("TLS config error: {}", e)))?;

            info!(addr = %config.addr, tls = true, "Starting podlet server");
            axum_server::bind_rustls(config.addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
        None => {
            info!(addr = %config.addr, tls = false, "Starting podlet server");
            axum_server::bind(config.addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
    };
    served.map_err(|e| Error::Internal(format!("Server error: {}", e)))?;

    info!("Server stopped");
    Ok(())
}
