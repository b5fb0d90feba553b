//! Collaborator contracts consumed by the application state machine.
//!
//! The state machine decides *when* an application is installed or
//! uninstalled; the types in this module are the parties that actually do it
//! (`ApplicationHandler`), build the artifact view it needs
//! (`ContainerFactory`), track live applications (`ApplicationMonitor`) and
//! publish the externally visible state (`ApplicationHelper`).

use crate::cache::AppCacheDirs;
use crate::config::ApplicationConfig;
use crate::dependency::ApplicationDependency;
use crate::state_machine::InternalState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Performs the real install/uninstall of an application type.
///
/// Both operations return a dependency that resolves `true` on success and
/// `false` or a failure otherwise. Returning an already completed dependency
/// is allowed and is handled as a synchronous completion.
pub trait ApplicationHandler: Send + Sync {
    fn install(&self, info: &Arc<InstallInfo>) -> ApplicationDependency;

    fn uninstall(&self, info: &Arc<InstallInfo>) -> ApplicationDependency;

    /// Describe what should be monitored for this installed application
    fn set_up_application_monitoring(&self, _info: &InstallInfo) -> Option<MonitoringInfo> {
        None
    }

    fn name(&self) -> &str {
        "application handler"
    }
}

/// True when both handles point at the same handler instance
pub fn same_handler(a: &Arc<dyn ApplicationHandler>, b: &Arc<dyn ApplicationHandler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const u8,
        Arc::as_ptr(b) as *const u8,
    )
}

/// View of a resolved application artifact handed to the handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// Resolved artifact path
    pub path: PathBuf,
    /// Per-application cache directories
    pub cache: AppCacheDirs,
    pub is_directory: bool,
}

/// Builds containers for resolved artifacts
pub trait ContainerFactory: Send + Sync {
    /// Returns `None` if the location cannot be turned into a container
    fn get_container(&self, cache: &AppCacheDirs, location_file: &Path) -> Option<Container>;
}

/// Accepts any existing file or directory
#[derive(Debug, Default, Clone)]
pub struct DirectoryContainerFactory;

impl ContainerFactory for DirectoryContainerFactory {
    fn get_container(&self, cache: &AppCacheDirs, location_file: &Path) -> Option<Container> {
        let metadata = std::fs::metadata(location_file).ok()?;
        Some(Container {
            path: location_file.to_path_buf(),
            cache: cache.clone(),
            is_directory: metadata.is_dir(),
        })
    }
}

/// What the surrounding runtime should watch for a live application
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitoringInfo {
    pub paths: Vec<PathBuf>,
    pub filter: Option<String>,
}

/// Everything the handler needs for one install
pub struct InstallInfo {
    pub config: Arc<ApplicationConfig>,
    pub container: Container,
    pub resource: PathBuf,
    pub handler: Arc<dyn ApplicationHandler>,
}

impl InstallInfo {
    pub fn pid(&self) -> &str {
        &self.config.pid
    }

    pub fn name(&self) -> &str {
        self.config.name.as_deref().unwrap_or(&self.config.pid)
    }
}

impl fmt::Debug for InstallInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallInfo")
            .field("pid", &self.config.pid)
            .field("resource", &self.resource)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Registry of live applications kept by the surrounding runtime
pub trait ApplicationMonitor: Send + Sync {
    fn add_application(&self, info: &Arc<InstallInfo>, monitoring: Option<&MonitoringInfo>);

    /// Withdraw the install previously added; a newer install of the same
    /// pid stays registered
    fn remove_application(&self, info: &Arc<InstallInfo>);
}

/// Externally visible application state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplicationState {
    Installed,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl ApplicationState {
    /// Collapse an internal state into what operators see
    pub fn from_internal(state: InternalState) -> ApplicationState {
        match state {
            InternalState::Initial | InternalState::Failed => ApplicationState::Installed,
            InternalState::Stopped | InternalState::Removed => ApplicationState::Stopped,
            InternalState::Starting => ApplicationState::Starting,
            InternalState::Started => ApplicationState::Started,
            InternalState::Stopping => ApplicationState::Stopping,
        }
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApplicationState::Installed => "INSTALLED",
            ApplicationState::Starting => "STARTING",
            ApplicationState::Started => "STARTED",
            ApplicationState::Stopping => "STOPPING",
            ApplicationState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Per-application sink for externally visible state and coordinator updates
pub trait ApplicationHelper: Send + Sync {
    /// `config` is `None` only when removing an application never configured
    fn switch_application_state(&self, config: Option<&ApplicationConfig>, state: ApplicationState);

    /// `false` when no handler will ever be available for the application type
    fn app_type_supported(&self) -> bool;

    fn notify_app_started(&self, pid: &str);

    fn notify_app_failed(&self, pid: &str);

    /// The application reached REMOVED; nothing may keep waiting on it
    fn notify_app_removed(&self, pid: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLayout;

    #[test]
    fn test_state_collapse() {
        assert_eq!(
            ApplicationState::from_internal(InternalState::Failed),
            ApplicationState::Installed
        );
        assert_eq!(
            ApplicationState::from_internal(InternalState::Started),
            ApplicationState::Started
        );
        assert_eq!(ApplicationState::Stopping.to_string(), "STOPPING");
    }

    #[test]
    fn test_directory_container_factory() {
        let temp = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(temp.path().join("workarea"));
        let dirs = layout.dirs_for("pid-1");

        let artifact = temp.path().join("app.war");
        std::fs::write(&artifact, b"war").unwrap();

        let factory = DirectoryContainerFactory;
        let container = factory.get_container(&dirs, &artifact).unwrap();
        assert_eq!(container.path, artifact);
        assert!(!container.is_directory);
        assert!(factory
            .get_container(&dirs, &temp.path().join("missing.war"))
            .is_none());
    }
}
