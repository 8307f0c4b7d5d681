use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::{info, warn};

/// Process-wide shutdown signal for the HTTP server.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<()>,
    is_shutting_down: AtomicBool,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx: tx,
            is_shutting_down: AtomicBool::new(false),
        }
    }

    /// Subscribe before spawning the waiter, or the signal may be missed.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn request_shutdown(&self) {
        if !self.is_shutting_down.swap(true, Ordering::Relaxed) {
            info!("Shutdown requested, draining in-flight executions...");
            let _ = self.shutdown_tx.send(());
        }
    }

    /// Resolve on SIGINT / SIGTERM (Ctrl+C elsewhere), then request shutdown.
    pub async fn wait_for_signal(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
            ) {
                (Ok(mut sigint), Ok(mut sigterm)) => {
                    tokio::select! {
                        _ = sigint.recv() => info!("Received SIGINT"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                    }
                }
                _ => {
                    warn!("Unix signal handlers unavailable, falling back to Ctrl+C");
                    wait_for_ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        wait_for_ctrl_c().await;

        self.request_shutdown();
    }
}

async fn wait_for_ctrl_c() {
    on_ctrl_c(tokio::signal::ctrl_c().await).await
}

/// A handler that could not be installed never fires.
async fn on_ctrl_c(outcome: std::io::Result<()>) {
    match outcome {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for Ctrl+C, waiting indefinitely");
            std::future::pending::<()>().await;
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}
