use super::AppManager;
use crate::error::{AppManagerError, Result};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info};

/// Upper bound on the whole removal phase of a shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

impl AppManager {
    /// Remove every application and wait, bounded, for the removals.
    /// Returns the process exit code.
    pub async fn shutdown(&self) -> Result<i32> {
        info!("Beginning graceful shutdown");
        let mut exit_code = 0;

        let discarded = self.table.discard_blocked();
        if discarded > 0 {
            info!("Discarded {} blocked application configuration(s)", discarded);
        }

        let mut pending = Vec::new();
        for pid in self.pids() {
            match self.uninstall_application(&pid, false) {
                Ok(removed) => pending.push((pid, removed)),
                Err(AppManagerError::AlreadyRemoved { .. }) => {}
                Err(e) => {
                    error!("Error removing {}: {}", pid, e);
                    exit_code = 1;
                }
            }
        }

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        for (pid, removed) in pending {
            match timeout_at(deadline, removed.wait()).await {
                Ok(Ok(_)) => info!("Application {} removed", pid),
                Ok(Err(e)) => {
                    error!("Error removing {}: {}", pid, e);
                    exit_code = 1;
                }
                Err(_) => {
                    error!("Application {} removal timeout", pid);
                    exit_code = 1;
                }
            }
        }

        info!("Graceful shutdown completed with exit code: {}", exit_code);
        Ok(exit_code)
    }
}
