use super::{AppManager, ShutdownReason};
use crate::error::{AppManagerError, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

type ShutdownSender = Arc<Mutex<Option<oneshot::Sender<ShutdownReason>>>>;

impl AppManager {
    /// Run until a shutdown is requested, then shut down gracefully
    pub async fn run(&mut self) -> Result<i32> {
        info!("Application manager is running");

        let shutdown_receiver = self
            .shutdown_receiver
            .take()
            .ok_or_else(|| AppManagerError::system("Shutdown receiver already taken"))?;

        self.setup_signal_handlers();

        let shutdown_reason = shutdown_receiver
            .await
            .map_err(|_| AppManagerError::system("Shutdown channel closed unexpectedly"))?;

        info!("Shutdown initiated: {:?}", shutdown_reason);

        let exit_code = self.shutdown().await?;

        info!("Application manager shutdown complete");
        Ok(exit_code)
    }

    /// Ask a running manager to shut down. Returns `false` if a shutdown was
    /// already requested.
    pub async fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        Self::send_shutdown(&self.shutdown_sender, reason).await
    }

    async fn send_shutdown(sender: &ShutdownSender, reason: ShutdownReason) -> bool {
        match sender.lock().await.take() {
            Some(sender) => sender.send(reason).is_ok(),
            None => false,
        }
    }

    fn setup_signal_handlers(&self) {
        // Handle SIGTERM (systemd stop) - Unix only
        #[cfg(unix)]
        {
            let sender = Arc::clone(&self.shutdown_sender);
            tokio::spawn(async move {
                let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(sigterm) => sigterm,
                    Err(e) => {
                        warn!("Failed to register SIGTERM handler: {}", e);
                        return;
                    }
                };
                if sigterm.recv().await.is_some() {
                    info!("Received SIGTERM signal");
                    Self::send_shutdown(&sender, ShutdownReason::Signal("SIGTERM".to_string()))
                        .await;
                }
            });
        }

        // Handle SIGINT (Ctrl+C) - Cross-platform
        let sender = Arc::clone(&self.shutdown_sender);
        tokio::spawn(async move {
            if let Ok(()) = signal::ctrl_c().await {
                info!("Received SIGINT signal (Ctrl+C)");
                Self::send_shutdown(&sender, ShutdownReason::Signal("SIGINT".to_string())).await;
            }
        });
    }
}
