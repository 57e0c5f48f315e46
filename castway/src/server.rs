use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use castway_sfu::SfuManager;
use tracing::{error, info, warn};

use crate::config::Config;

/// How long to wait for peer connections to close after the HTTP server stops
const TRANSPORT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP front end plus the routing engine behind it
pub struct CastwayServer {
    config: Config,
    sfu: Arc<SfuManager>,
}

impl CastwayServer {
    pub const fn new(config: Config, sfu: Arc<SfuManager>) -> Self {
        Self { config, sfu }
    }

    /// Serve until a shutdown signal arrives, then close every live transport
    pub async fn start(self) -> anyhow::Result<()> {
        let http_address = self.config.http_address();
        let http_addr: SocketAddr = http_address
            .parse()
            .with_context(|| format!("Invalid HTTP address '{http_address}'"))?;

        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("Failed to bind HTTP address {http_addr}"))?;
        info!("HTTP server listening on {}", http_addr);

        let router = castway_api::create_router(Arc::clone(&self.sfu));
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        if let Err(e) = &result {
            error!("HTTP server error: {}", e);
        }

        if tokio::time::timeout(TRANSPORT_DRAIN_TIMEOUT, self.sfu.shutdown())
            .await
            .is_err()
        {
            warn!(
                open_transports = self.sfu.open_transports(),
                "Timed out waiting for transports to close"
            );
        }
        info!("Castway server shut down");

        result.map_err(Into::into)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C, starting graceful shutdown"); }
        () = terminate => { info!("Received SIGTERM, starting graceful shutdown"); }
    }
}
