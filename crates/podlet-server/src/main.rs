//! podlet binary

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use podlet_server::{start_server, telemetry, Cli, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // TLS needs a process-wide crypto provider before any config is built
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    telemetry::init_tracing(cli.log_format)?;
    let config = ServerConfig::from_cli(&cli)?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            info!("Received shutdown signal");
            shutdown.cancel();
        }
    });

    start_server(config, shutdown).await?;
    Ok(())
}
