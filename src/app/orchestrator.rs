use super::state::{AppStates, MonitorRegistry};
use super::table::ApplicationTable;
use super::types::{ApplicationSummary, ShutdownReason};
use crate::cache::CacheLayout;
use crate::config::{ApplicationConfig, ManagerConfig, MonitorTrigger};
use crate::dependency::ApplicationDependency;
use crate::error::{AppManagerError, Result};
use crate::events::EventBus;
use crate::handler::{ApplicationHandler, ApplicationState, DirectoryContainerFactory};
use crate::monitor::{ExternalTriggerMonitor, FileMonitor, NotifyFileMonitor};
use crate::resolve::{HttpFetcher, ResolverContext};
use crate::state_machine::{
    ApplicationStateMachine, Executors, MachineSettings, StateMachineFactory,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Owns one state machine per configured application and the collaborators
/// they share
pub struct AppManager {
    pub(super) config: ManagerConfig,
    pub(super) events: EventBus,
    pub(super) external_monitor: Option<Arc<ExternalTriggerMonitor>>,
    pub(super) registry: Arc<MonitorRegistry>,
    pub(super) table: Arc<ApplicationTable>,

    // Lifecycle management
    pub(super) shutdown_sender: Arc<tokio::sync::Mutex<Option<oneshot::Sender<ShutdownReason>>>>,
    pub(super) shutdown_receiver: Option<oneshot::Receiver<ShutdownReason>>,
}

impl AppManager {
    /// Create a manager on the current runtime
    pub async fn new(config: ManagerConfig) -> Result<Self> {
        let executors = Executors::current();
        let events = if tracing::enabled!(tracing::Level::DEBUG) {
            EventBus::with_debug_logging(config.lifecycle.event_bus_capacity)
        } else {
            EventBus::new(config.lifecycle.event_bus_capacity)
        };
        let cache = CacheLayout::new(config.server.cache_root.clone());
        let (file_monitor, external_monitor) = Self::file_monitor(&config);

        let resolver = Arc::new(ResolverContext {
            apps_dir: config.server.apps_dir.clone(),
            shared_apps_dir: config.server.shared_apps_dir.clone(),
            cache: cache.clone(),
            monitor: file_monitor,
            fetcher: Arc::new(HttpFetcher::new(DOWNLOAD_TIMEOUT)?),
            events: events.clone(),
            executor: executors.general.clone(),
        });

        let registry = MonitorRegistry::new();
        let factory = StateMachineFactory::new(
            executors.clone(),
            events.clone(),
            resolver,
            Arc::new(DirectoryContainerFactory),
            registry.clone(),
            MachineSettings::from_config(&config),
        );
        let table = ApplicationTable::new(
            factory,
            AppStates::new(),
            cache,
            events.clone(),
            executors.general.clone(),
        );
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        Ok(Self {
            config,
            events,
            external_monitor,
            registry,
            table,
            shutdown_sender: Arc::new(tokio::sync::Mutex::new(Some(shutdown_sender))),
            shutdown_receiver: Some(shutdown_receiver),
        })
    }

    fn file_monitor(
        config: &ManagerConfig,
    ) -> (Option<Arc<dyn FileMonitor>>, Option<Arc<ExternalTriggerMonitor>>) {
        if !config.monitor.enabled {
            info!("File monitoring disabled, missing applications fail immediately");
            return (None, None);
        }
        match config.monitor.trigger {
            MonitorTrigger::Polled => {
                debug!("Polling for application changes every {:?}", config.monitor_interval());
                let monitor: Arc<dyn FileMonitor> =
                    Arc::new(NotifyFileMonitor::new(config.monitor_interval()));
                (Some(monitor), None)
            }
            MonitorTrigger::External => {
                debug!("Application changes are detected on external trigger");
                let monitor = Arc::new(ExternalTriggerMonitor::new());
                (Some(monitor.clone() as Arc<dyn FileMonitor>), Some(monitor))
            }
            MonitorTrigger::Disabled => (None, None),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn states(&self) -> &Arc<AppStates> {
        &self.table.states
    }

    pub fn registry(&self) -> &Arc<MonitorRegistry> {
        &self.registry
    }

    /// Add or update an application.
    ///
    /// The returned dependency resolves once the application has started
    /// with this configuration. A configuration naming an application that
    /// another pid already owns waits until that pid is uninstalled.
    pub fn configure_application(&self, config: ApplicationConfig) -> Result<ApplicationDependency> {
        self.table.configure(config, None)
    }

    /// Make `handler` responsible for every application of `app_type`
    pub fn register_handler(&self, app_type: &str, handler: Arc<dyn ApplicationHandler>) {
        self.table.register_handler(app_type, handler);
    }

    /// Revoke the handler for `app_type`. Its applications are recycled and
    /// stay stopped until another handler is registered.
    pub fn unregister_handler(&self, app_type: &str) -> Option<Arc<dyn ApplicationHandler>> {
        self.table.unregister_handler(app_type)
    }

    /// Stop and restart the given applications, or all of them for `None`.
    /// Returns a dependency per recycled application resolving once it has
    /// stopped.
    pub fn recycle_applications(&self, pids: Option<&[String]>) -> Vec<ApplicationDependency> {
        self.table.recycle_applications(pids)
    }

    pub fn machine(&self, pid: &str) -> Option<ApplicationStateMachine> {
        self.table.machine(pid)
    }

    fn require(&self, pid: &str) -> Result<ApplicationStateMachine> {
        self.machine(pid)
            .ok_or_else(|| AppManagerError::UnknownApplication {
                pid: pid.to_string(),
            })
    }

    pub fn start(&self, pid: &str) -> Result<ApplicationDependency> {
        Ok(self.require(pid)?.start())
    }

    pub fn stop(&self, pid: &str) -> Result<ApplicationDependency> {
        Ok(self.require(pid)?.stop())
    }

    pub fn restart(&self, pid: &str) -> Result<()> {
        self.require(pid)?.restart();
        Ok(())
    }

    /// Remove an application. Its cache directories are deleted afterwards
    /// when `clean_cache` is set, unless the pid has been configured again
    /// by then.
    pub fn uninstall_application(&self, pid: &str, clean_cache: bool) -> Result<ApplicationDependency> {
        self.table.uninstall(pid, clean_cache)
    }

    /// Pids whose configuration waits for another application to release
    /// its name
    pub fn blocked_applications(&self) -> Vec<String> {
        self.table.blocked_pids()
    }

    /// Start-after chain leading from `pid` back into itself, if any
    pub fn start_after_cycle(&self, pid: &str) -> Option<Vec<String>> {
        self.table.start_after_cycle(pid)
    }

    /// Rescan watched locations when changes are delivered by trigger.
    /// Returns the number of change sets found.
    pub fn trigger_file_scan(&self) -> usize {
        match &self.external_monitor {
            Some(monitor) => monitor.trigger(),
            None => {
                debug!("File scan requested but no externally triggered monitor is configured");
                0
            }
        }
    }

    pub fn application_state(&self, pid: &str) -> Option<ApplicationState> {
        self.table.states.get(pid)
    }

    pub fn application_states(&self) -> HashMap<String, ApplicationState> {
        self.table.states.all()
    }

    pub fn pids(&self) -> Vec<String> {
        let mut pids: Vec<String> = self.table.applications.lock().keys().cloned().collect();
        pids.sort();
        pids
    }

    pub fn summaries(&self) -> Vec<ApplicationSummary> {
        let mut summaries: Vec<ApplicationSummary> = self
            .table
            .applications
            .lock()
            .iter()
            .map(|(pid, app)| ApplicationSummary {
                pid: pid.clone(),
                name: app.name.clone(),
                app_type: Some(app.app_type.clone()).filter(|t| !t.is_empty()),
                state: app.machine.state(),
                external_state: self.table.states.get(pid),
                blocked: app.machine.is_blocked(),
            })
            .collect();
        summaries.sort_by(|a, b| a.pid.cmp(&b.pid));
        summaries
    }

    /// Diagnostic dump of every machine
    pub fn describe(&self) -> String {
        let mut machines: Vec<ApplicationStateMachine> = self
            .table
            .applications
            .lock()
            .values()
            .map(|app| app.machine.clone())
            .collect();
        machines.sort_by(|a, b| a.pid().cmp(b.pid()));

        let mut buffer = String::new();
        for machine in machines {
            machine.describe(&mut buffer);
        }
        buffer
    }
}
