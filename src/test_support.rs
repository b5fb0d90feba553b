//! Scripted collaborators shared by unit tests.

use crate::cache::CacheLayout;
use crate::config::ApplicationConfig;
use crate::dependency::{ApplicationDependency, Dependency};
use crate::error::AppManagerError;
use crate::handler::{
    ApplicationHandler, ApplicationHelper, ApplicationMonitor, ApplicationState, Container,
    InstallInfo, MonitoringInfo,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// How a scripted handler answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Completes `true` before returning
    Succeed,
    /// Completes `false` before returning
    Reject,
    /// Fails before returning
    Fail,
    /// Stays pending until the test completes it
    Manual,
}

pub struct ScriptedHandler {
    install: Mutex<Reply>,
    uninstall: Mutex<Reply>,
    installs: AtomicUsize,
    uninstalls: AtomicUsize,
    pending_installs: Mutex<Vec<ApplicationDependency>>,
    pending_uninstalls: Mutex<Vec<ApplicationDependency>>,
}

impl ScriptedHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            install: Mutex::new(Reply::Succeed),
            uninstall: Mutex::new(Reply::Succeed),
            installs: AtomicUsize::new(0),
            uninstalls: AtomicUsize::new(0),
            pending_installs: Mutex::new(Vec::new()),
            pending_uninstalls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_install(&self, reply: Reply) {
        *self.install.lock() = reply;
    }

    pub fn set_uninstall(&self, reply: Reply) {
        *self.uninstall.lock() = reply;
    }

    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn uninstall_count(&self) -> usize {
        self.uninstalls.load(Ordering::SeqCst)
    }

    pub fn take_pending_installs(&self) -> Vec<ApplicationDependency> {
        std::mem::take(&mut *self.pending_installs.lock())
    }

    pub fn take_pending_uninstalls(&self) -> Vec<ApplicationDependency> {
        std::mem::take(&mut *self.pending_uninstalls.lock())
    }

    fn answer(
        reply: Reply,
        description: String,
        pending: &Mutex<Vec<ApplicationDependency>>,
    ) -> ApplicationDependency {
        match reply {
            Reply::Succeed => Dependency::resolved(description, true),
            Reply::Reject => Dependency::resolved(description, false),
            Reply::Fail => Dependency::failed(
                description,
                AppManagerError::system("scripted failure").into_cause(),
            ),
            Reply::Manual => {
                let dependency = Dependency::new(description);
                pending.lock().push(dependency.clone());
                dependency
            }
        }
    }
}

impl ApplicationHandler for ScriptedHandler {
    fn install(&self, info: &Arc<InstallInfo>) -> ApplicationDependency {
        self.installs.fetch_add(1, Ordering::SeqCst);
        let reply = *self.install.lock();
        Self::answer(reply, format!("install {}", info.pid()), &self.pending_installs)
    }

    fn uninstall(&self, info: &Arc<InstallInfo>) -> ApplicationDependency {
        self.uninstalls.fetch_add(1, Ordering::SeqCst);
        let reply = *self.uninstall.lock();
        Self::answer(reply, format!("uninstall {}", info.pid()), &self.pending_uninstalls)
    }

    fn set_up_application_monitoring(&self, info: &InstallInfo) -> Option<MonitoringInfo> {
        Some(MonitoringInfo {
            paths: vec![info.resource.clone()],
            filter: None,
        })
    }

    fn name(&self) -> &str {
        "scripted handler"
    }
}

pub fn install_info(pid: &str, handler: Arc<ScriptedHandler>) -> Arc<InstallInfo> {
    let layout = CacheLayout::new("/tmp/appmanager-test");
    let resource = PathBuf::from(format!("/apps/{}.war", pid));
    Arc::new(InstallInfo {
        config: Arc::new(ApplicationConfig::new(pid, pid, format!("{}.war", pid), "war")),
        container: Container {
            path: resource.clone(),
            cache: layout.dirs_for(pid),
            is_directory: false,
        },
        resource,
        handler,
    })
}

/// Records every externally visible state switch
pub struct RecordingHelper {
    pub states: Mutex<Vec<ApplicationState>>,
    pub started: Mutex<Vec<String>>,
    pub failed: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    supported: AtomicBool,
}

impl RecordingHelper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            states: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            supported: AtomicBool::new(true),
        })
    }

    pub fn set_supported(&self, supported: bool) {
        self.supported.store(supported, Ordering::SeqCst);
    }

    pub fn last_state(&self) -> Option<ApplicationState> {
        self.states.lock().last().copied()
    }
}

impl ApplicationHelper for RecordingHelper {
    fn switch_application_state(&self, _config: Option<&ApplicationConfig>, state: ApplicationState) {
        self.states.lock().push(state);
    }

    fn app_type_supported(&self) -> bool {
        self.supported.load(Ordering::SeqCst)
    }

    fn notify_app_started(&self, pid: &str) {
        self.started.lock().push(pid.to_string());
    }

    fn notify_app_failed(&self, pid: &str) {
        self.failed.lock().push(pid.to_string());
    }

    fn notify_app_removed(&self, pid: &str) {
        self.removed.lock().push(pid.to_string());
    }
}

/// Records live applications
#[derive(Default)]
pub struct RecordingMonitor {
    pub live: Mutex<Vec<String>>,
}

impl ApplicationMonitor for RecordingMonitor {
    fn add_application(&self, info: &Arc<InstallInfo>, _monitoring: Option<&MonitoringInfo>) {
        self.live.lock().push(info.pid().to_string());
    }

    fn remove_application(&self, info: &Arc<InstallInfo>) {
        self.live.lock().retain(|live| live != info.pid());
    }
}
