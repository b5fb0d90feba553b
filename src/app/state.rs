//! In-memory bookkeeping behind the state machines' collaborator traits.

use crate::config::ApplicationConfig;
use crate::dependency::{ApplicationDependency, Dependency};
use crate::handler::{
    ApplicationHelper, ApplicationMonitor, ApplicationState, InstallInfo, MonitoringInfo,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct StatesInner {
    states: HashMap<String, ApplicationState>,
    started_waiters: HashMap<String, Vec<ApplicationDependency>>,
    failures: HashMap<String, usize>,
    app_types: HashMap<String, String>,
    /// Machine instance currently reporting for each pid
    owners: HashMap<String, u64>,
    next_owner: u64,
    /// `None` accepts every type
    supported_types: Option<HashSet<String>>,
}

/// Externally visible application states, keyed by pid.
///
/// Also hands out the start-after gates: a gate for pid `p` resolves the
/// next time `p` reports `STARTED` or is removed, or immediately if it has
/// already started.
///
/// Each helper belongs to one machine instance. Once a pid is handed to a
/// new instance, reports from the previous one are ignored.
#[derive(Default)]
pub struct AppStates {
    inner: Mutex<StatesInner>,
}

impl AppStates {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Helper reporting into this table for a new machine instance of `pid`
    pub fn helper_for(self: &Arc<Self>, pid: &str) -> Arc<dyn ApplicationHelper> {
        let owner = {
            let mut inner = self.inner.lock();
            inner.next_owner += 1;
            let owner = inner.next_owner;
            inner.owners.insert(pid.to_string(), owner);
            owner
        };
        Arc::new(TrackedApplication {
            pid: pid.to_string(),
            owner,
            states: Arc::clone(self),
        })
    }

    /// Record the type `pid` is currently configured with
    pub fn set_app_type(&self, pid: &str, app_type: &str) {
        self.inner
            .lock()
            .app_types
            .insert(pid.to_string(), app_type.to_string());
    }

    pub fn get(&self, pid: &str) -> Option<ApplicationState> {
        self.inner.lock().states.get(pid).copied()
    }

    pub fn all(&self) -> HashMap<String, ApplicationState> {
        self.inner.lock().states.clone()
    }

    pub fn failure_count(&self, pid: &str) -> usize {
        self.inner.lock().failures.get(pid).copied().unwrap_or(0)
    }

    /// Declare the complete set of types a handler will ever exist for
    pub fn restrict_types<I, S>(&self, types: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.lock().supported_types = Some(types.into_iter().map(Into::into).collect());
    }

    pub fn supports(&self, app_type: &str) -> bool {
        match &self.inner.lock().supported_types {
            Some(types) => types.contains(app_type),
            None => true,
        }
    }

    fn supports_application(&self, pid: &str) -> bool {
        let inner = self.inner.lock();
        match (&inner.supported_types, inner.app_types.get(pid)) {
            (None, _) => true,
            (Some(types), Some(app_type)) => types.contains(app_type),
            (Some(_), None) => false,
        }
    }

    /// Gate resolved once `pid` reports `STARTED`
    pub fn started_gate(&self, pid: &str) -> ApplicationDependency {
        let gate = Dependency::new(format!("{} started", pid));
        let already_started = {
            let mut inner = self.inner.lock();
            if inner.states.get(pid) == Some(&ApplicationState::Started) {
                true
            } else {
                inner
                    .started_waiters
                    .entry(pid.to_string())
                    .or_default()
                    .push(gate.clone());
                false
            }
        };
        if already_started {
            gate.resolve(true);
        }
        gate
    }

    /// Number of start-after gates still waiting on `pid`
    pub fn waiting_on(&self, pid: &str) -> usize {
        self.inner
            .lock()
            .started_waiters
            .get(pid)
            .map_or(0, Vec::len)
    }

    pub fn forget(&self, pid: &str) {
        let mut inner = self.inner.lock();
        inner.states.remove(pid);
        inner.failures.remove(pid);
        inner.app_types.remove(pid);
        inner.owners.remove(pid);
    }

    fn release(pid: &str, gates: Vec<ApplicationDependency>, why: &str) {
        if !gates.is_empty() {
            debug!("Releasing {} start-after gate(s) on {} ({})", gates.len(), pid, why);
        }
        for gate in gates {
            gate.resolve(true);
        }
    }

    fn record(&self, pid: &str, owner: u64, state: ApplicationState) {
        let released = {
            let mut inner = self.inner.lock();
            if inner.owners.get(pid) != Some(&owner) {
                debug!("Ignoring {} reported by a replaced instance of {}", state, pid);
                return;
            }
            let previous = inner.states.insert(pid.to_string(), state);
            if previous != Some(state) {
                debug!("Application {} is now {}", pid, state);
            }
            if state == ApplicationState::Started {
                inner.started_waiters.remove(pid).unwrap_or_default()
            } else {
                Vec::new()
            }
        };
        Self::release(pid, released, "started");
    }

    /// A removed application never starts; its dependents must not wait
    fn record_removal(&self, pid: &str, owner: u64) {
        let released = {
            let mut inner = self.inner.lock();
            if inner.owners.get(pid) != Some(&owner) {
                return;
            }
            inner.started_waiters.remove(pid).unwrap_or_default()
        };
        Self::release(pid, released, "removed");
    }

    fn record_failure(&self, pid: &str, owner: u64) {
        let mut inner = self.inner.lock();
        if inner.owners.get(pid) == Some(&owner) {
            *inner.failures.entry(pid.to_string()).or_default() += 1;
        }
    }
}

struct TrackedApplication {
    pid: String,
    owner: u64,
    states: Arc<AppStates>,
}

impl ApplicationHelper for TrackedApplication {
    fn switch_application_state(&self, _config: Option<&ApplicationConfig>, state: ApplicationState) {
        self.states.record(&self.pid, self.owner, state);
    }

    fn app_type_supported(&self) -> bool {
        self.states.supports_application(&self.pid)
    }

    fn notify_app_started(&self, pid: &str) {
        info!("Application {} started", pid);
    }

    fn notify_app_failed(&self, pid: &str) {
        warn!("Application {} failed", pid);
        self.states.record_failure(&self.pid, self.owner);
    }

    fn notify_app_removed(&self, pid: &str) {
        debug!("Application {} removed", pid);
        self.states.record_removal(&self.pid, self.owner);
    }
}

/// Live application as seen by the monitor registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredApplication {
    pub name: String,
    pub resource: PathBuf,
    pub monitoring: Option<MonitoringInfo>,
}

/// Registry of installed applications
#[derive(Default)]
pub struct MonitorRegistry {
    live: Mutex<HashMap<String, (Arc<InstallInfo>, MonitoredApplication)>>,
}

impl MonitorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, pid: &str) -> Option<MonitoredApplication> {
        self.live.lock().get(pid).map(|(_, app)| app.clone())
    }

    pub fn is_live(&self, pid: &str) -> bool {
        self.live.lock().contains_key(pid)
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }
}

impl ApplicationMonitor for MonitorRegistry {
    fn add_application(&self, info: &Arc<InstallInfo>, monitoring: Option<&MonitoringInfo>) {
        debug!("Monitoring {} at {}", info.pid(), info.resource.display());
        let app = MonitoredApplication {
            name: info.name().to_string(),
            resource: info.resource.clone(),
            monitoring: monitoring.cloned(),
        };
        self.live
            .lock()
            .insert(info.pid().to_string(), (Arc::clone(info), app));
    }

    fn remove_application(&self, info: &Arc<InstallInfo>) {
        let pid = info.pid();
        let mut live = self.live.lock();
        if live
            .get(pid)
            .is_some_and(|(installed, _)| Arc::ptr_eq(installed, info))
        {
            live.remove(pid);
            debug!("Stopped monitoring {}", pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{install_info, ScriptedHandler};

    #[test]
    fn test_started_gate_waits_for_started() {
        let states = AppStates::new();
        let helper = states.helper_for("db");
        let gate = states.started_gate("db");

        helper.switch_application_state(None, ApplicationState::Starting);
        assert!(gate.is_pending());

        helper.switch_application_state(None, ApplicationState::Started);
        assert!(gate.outcome().unwrap().unwrap());
        assert_eq!(states.get("db"), Some(ApplicationState::Started));

        // already started: resolved on creation
        assert!(states.started_gate("db").is_done());
    }

    #[test]
    fn test_removal_releases_started_gates() {
        let states = AppStates::new();
        let helper = states.helper_for("db");
        let gate = states.started_gate("db");
        assert_eq!(states.waiting_on("db"), 1);

        helper.switch_application_state(None, ApplicationState::Stopped);
        assert!(gate.is_pending());

        helper.notify_app_removed("db");
        assert!(gate.outcome().unwrap().unwrap());
        assert_eq!(states.waiting_on("db"), 0);
    }

    #[test]
    fn test_replaced_instance_cannot_overwrite_state() {
        let states = AppStates::new();
        let old = states.helper_for("web");
        old.switch_application_state(None, ApplicationState::Stopping);
        let gate = states.started_gate("web");

        let new = states.helper_for("web");
        old.notify_app_removed("web");
        assert!(gate.is_pending());

        new.switch_application_state(None, ApplicationState::Started);
        assert!(gate.is_done());

        old.switch_application_state(None, ApplicationState::Stopped);
        old.notify_app_failed("web");
        assert_eq!(states.get("web"), Some(ApplicationState::Started));
        assert_eq!(states.failure_count("web"), 0);
    }

    #[test]
    fn test_registry_keeps_newer_install() {
        let registry = MonitorRegistry::new();
        let handler = ScriptedHandler::new();
        let old = install_info("web", handler.clone());
        let new = install_info("web", handler);

        registry.add_application(&old, None);
        registry.add_application(&new, None);
        registry.remove_application(&old);
        assert!(registry.is_live("web"));

        registry.remove_application(&new);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_restricted_types() {
        let states = AppStates::new();
        let helper = states.helper_for("a");
        states.set_app_type("a", "ear");
        assert!(helper.app_type_supported());

        states.restrict_types(["war"]);
        assert!(!helper.app_type_supported());
        assert!(!states.supports("ear"));

        // reconfigured with a supported type
        states.set_app_type("a", "war");
        assert!(helper.app_type_supported());
    }

    #[test]
    fn test_failures_are_counted() {
        let states = AppStates::new();
        let helper = states.helper_for("a");
        helper.notify_app_failed("a");
        helper.notify_app_failed("a");
        assert_eq!(states.failure_count("a"), 2);

        states.forget("a");
        assert_eq!(states.failure_count("a"), 0);
    }
}
