use crate::dependency::{ApplicationDependency, Dependency};
use crate::error::AppManagerError;
use crate::handler::{ApplicationHandler, InstallInfo, MonitoringInfo};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error};

pub const MARKER_FILE: &str = "installed.marker";

/// Handler that "installs" an application by writing a marker file into its
/// cache directory and uninstalls it by removing the marker again.
///
/// Stands in for a real container integration; both operations complete
/// asynchronously on the given runtime.
pub struct MarkerFileHandler {
    runtime: Handle,
}

impl MarkerFileHandler {
    pub fn new(runtime: Handle) -> Arc<Self> {
        Arc::new(Self { runtime })
    }

    pub fn marker_path(info: &InstallInfo) -> PathBuf {
        info.container.cache.cache.join(MARKER_FILE)
    }
}

impl ApplicationHandler for MarkerFileHandler {
    fn install(&self, info: &Arc<InstallInfo>) -> ApplicationDependency {
        let done = Dependency::new(format!("install {}", info.name()));
        let result = done.clone();
        let info = Arc::clone(info);

        self.runtime.spawn(async move {
            let marker = MarkerFileHandler::marker_path(&info);
            let written = async {
                if let Some(dir) = marker.parent() {
                    tokio::fs::create_dir_all(dir).await?;
                }
                tokio::fs::write(&marker, info.resource.to_string_lossy().as_bytes()).await
            };
            match written.await {
                Ok(()) => {
                    debug!("Wrote {}", marker.display());
                    done.resolve(true);
                }
                Err(e) => {
                    error!("Failed to write {}: {}", marker.display(), e);
                    done.fail(AppManagerError::from(e).into_cause());
                }
            }
        });
        result
    }

    fn uninstall(&self, info: &Arc<InstallInfo>) -> ApplicationDependency {
        let done = Dependency::new(format!("uninstall {}", info.name()));
        let result = done.clone();
        let marker = MarkerFileHandler::marker_path(info);

        self.runtime.spawn(async move {
            match tokio::fs::remove_file(&marker).await {
                Ok(()) => {
                    debug!("Removed {}", marker.display());
                    done.resolve(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    done.resolve(true);
                }
                Err(e) => {
                    error!("Failed to remove {}: {}", marker.display(), e);
                    done.fail(AppManagerError::from(e).into_cause());
                }
            }
        });
        result
    }

    fn set_up_application_monitoring(&self, info: &InstallInfo) -> Option<MonitoringInfo> {
        Some(MonitoringInfo {
            paths: vec![info.resource.clone()],
            filter: None,
        })
    }

    fn name(&self) -> &str {
        "marker file handler"
    }
}
