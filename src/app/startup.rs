use super::AppManager;
use crate::error::Result;
use tracing::{error, info};

impl AppManager {
    /// Configure every application listed in the manager configuration
    pub fn initialize(&self) -> Result<usize> {
        let applications = self.config.applications.clone();
        info!("Configuring {} application(s)", applications.len());

        for application in &applications {
            self.configure_application(application.clone())
                .map_err(|e| {
                    error!("Failed to configure {}: {}", application.label(), e);
                    e
                })?;
        }

        info!("All applications configured");
        Ok(applications.len())
    }

    /// Release the manager-wide start gate so configured applications may
    /// start
    pub fn start_applications(&self) {
        if self.table.ready.resolve(true) {
            info!("Application manager ready, starting applications");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.table.ready.is_done()
    }
}
