//! Laundry HTTP server: binds the listener, runs the status monitor alongside
//! the router, and tears both down together.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::service::LaundryService;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

impl ServerConfig {
    fn addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

/// Serve until `shutdown` is cancelled.
///
/// The status monitor runs for exactly as long as the server does: it starts
/// once the listener is bound and is stopped and joined before this returns,
/// so no sweep outlives the process' last request.
pub async fn serve(
    config: ServerConfig,
    service: Arc<LaundryService>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.addr()?).await?;
    let local_addr = listener.local_addr()?;

    let monitor_stop = shutdown.child_token();
    let monitor = service.start_monitor(monitor_stop.clone());
    tracing::info!(
        addr = %local_addr,
        machines = service.config().machines,
        poll_interval_secs = service.config().poll_interval.as_secs(),
        "Laundry server listening"
    );

    let served = axum::serve(listener, routes(Arc::clone(&service)))
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .await;

    monitor_stop.cancel();
    if let Err(e) = monitor.await {
        tracing::warn!(error = %e, "Status monitor did not stop cleanly");
    }
    tracing::info!("Laundry server stopped");

    served.map_err(Into::into)
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
///
/// A handler that cannot be installed is logged and never fires; the other
/// signal still works.
pub async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}
