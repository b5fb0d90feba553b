use super::*;
use crate::config::{ApplicationConfig, ManagerConfig, MonitorTrigger};
use crate::dependency::{ApplicationDependency, Outcome};
use crate::error::AppManagerError;
use crate::events::LifecycleEvent;
use crate::handler::{ApplicationHandler, ApplicationState};
use crate::state_machine::InternalState;
use crate::test_support::{Reply, ScriptedHandler};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

struct Fixture {
    _temp: tempfile::TempDir,
    apps: PathBuf,
    config: ManagerConfig,
}

impl Fixture {
    fn new(trigger: MonitorTrigger) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let apps = temp.path().join("apps");
        let shared = temp.path().join("shared");
        std::fs::create_dir_all(&apps).unwrap();
        std::fs::create_dir_all(&shared).unwrap();

        let mut config = ManagerConfig::default();
        config.server.apps_dir = apps.clone();
        config.server.shared_apps_dir = shared;
        config.server.cache_root = temp.path().join("workarea");
        config.monitor.enabled = trigger != MonitorTrigger::Disabled;
        config.monitor.trigger = trigger;
        config.lifecycle.restart_drain_timeout_seconds = 2;

        Self {
            _temp: temp,
            apps,
            config,
        }
    }

    async fn manager(&self) -> AppManager {
        AppManager::new(self.config.clone()).await.unwrap()
    }

    fn artifact(&self, pid: &str) {
        std::fs::write(self.apps.join(format!("{}.war", pid)), b"war").unwrap();
    }

    fn cache_dir(&self, pid: &str) -> PathBuf {
        self.config.server.cache_root.join("cache").join(pid)
    }

    fn marker(&self, pid: &str) -> PathBuf {
        self.cache_dir(pid).join(MARKER_FILE)
    }
}

fn app_config(pid: &str) -> ApplicationConfig {
    ApplicationConfig::new(pid, format!("{}-app", pid), format!("{}.war", pid), "war")
}

fn marker_handler() -> Arc<dyn ApplicationHandler> {
    MarkerFileHandler::new(Handle::current())
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("Timed out waiting for {}", what);
}

async fn outcome_of(dependency: &ApplicationDependency) -> Outcome<bool> {
    dependency
        .wait_timeout(Duration::from_secs(5))
        .await
        .unwrap_or_else(|| panic!("{} never completed", dependency.description()))
}

/// Ready manager with the marker handler and `pid` started
async fn running(fixture: &Fixture, pid: &str) -> AppManager {
    fixture.artifact(pid);
    let manager = fixture.manager().await;
    manager.register_handler("war", marker_handler());
    manager.start_applications();
    let started = manager.configure_application(app_config(pid)).unwrap();
    assert!(outcome_of(&started).await.unwrap());
    manager
}

#[tokio::test]
async fn test_applications_wait_for_manager_ready() {
    let fixture = Fixture::new(MonitorTrigger::External);
    fixture.artifact("web");
    let manager = fixture.manager().await;
    manager.register_handler("war", marker_handler());

    let started = manager.configure_application(app_config("web")).unwrap();
    assert_eq!(
        manager.application_state("web"),
        Some(ApplicationState::Stopped)
    );
    assert!(manager.machine("web").unwrap().is_blocked());
    assert!(!manager.is_ready());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(started.is_pending());

    manager.start_applications();
    assert!(outcome_of(&started).await.unwrap());
    assert_eq!(
        manager.application_state("web"),
        Some(ApplicationState::Started)
    );
    assert!(fixture.marker("web").exists());

    let live = manager.registry().get("web").unwrap();
    assert_eq!(live.name, "web-app");
    assert_eq!(live.resource, fixture.apps.join("web.war"));
}

#[tokio::test]
async fn test_initialize_configures_listed_applications() {
    let mut fixture = Fixture::new(MonitorTrigger::External);
    fixture.config.applications = vec![app_config("a"), app_config("b")];
    fixture.artifact("a");
    fixture.artifact("b");

    let manager = fixture.manager().await;
    manager.register_handler("war", marker_handler());
    assert_eq!(manager.initialize().unwrap(), 2);
    assert_eq!(manager.pids(), vec!["a".to_string(), "b".to_string()]);

    manager.start_applications();
    wait_until("both applications started", || {
        manager.application_state("a") == Some(ApplicationState::Started)
            && manager.application_state("b") == Some(ApplicationState::Started)
    })
    .await;
}

#[tokio::test]
async fn test_start_after_waits_for_named_application() {
    let fixture = Fixture::new(MonitorTrigger::External);
    fixture.artifact("web");
    let manager = fixture.manager().await;
    manager.register_handler("war", marker_handler());
    manager.start_applications();
    let mut events = manager.events().subscribe();

    let mut web = app_config("web");
    web.start_after = vec!["db".to_string()];
    let web_started = manager.configure_application(web).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(web_started.is_pending());
    assert!(manager.machine("web").unwrap().is_blocked());

    fixture.artifact("db");
    let db_started = manager.configure_application(app_config("db")).unwrap();
    assert!(outcome_of(&db_started).await.unwrap());
    assert!(outcome_of(&web_started).await.unwrap());

    let mut order = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let LifecycleEvent::Started { pid, .. } = event {
            order.push(pid);
        }
    }
    assert_eq!(order, vec!["db".to_string(), "web".to_string()]);
}

#[tokio::test]
async fn test_removed_start_after_target_releases_dependents() {
    let fixture = Fixture::new(MonitorTrigger::External);
    fixture.artifact("web");
    let manager = fixture.manager().await;
    manager.register_handler("war", marker_handler());
    manager.start_applications();

    // db has no artifact yet, so it never starts
    let db_started = manager.configure_application(app_config("db")).unwrap();
    let mut web = app_config("web");
    web.start_after = vec!["db".to_string()];
    let web_started = manager.configure_application(web).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(web_started.is_pending());
    assert_eq!(manager.states().waiting_on("db"), 1);

    let removed = manager.uninstall_application("db", false).unwrap();
    assert!(outcome_of(&removed).await.unwrap());
    assert!(outcome_of(&db_started).await.is_ok());
    assert!(outcome_of(&web_started).await.unwrap());
    assert_eq!(
        manager.application_state("web"),
        Some(ApplicationState::Started)
    );
    assert_eq!(manager.states().waiting_on("db"), 0);
}

#[tokio::test]
async fn test_start_after_cycle_is_reported_once() {
    let fixture = Fixture::new(MonitorTrigger::External);
    let manager = fixture.manager().await;
    let mut events = manager.events().subscribe();

    let mut a = app_config("a");
    a.start_after = vec!["b".to_string()];
    let mut b = app_config("b");
    b.start_after = vec!["a".to_string()];

    manager.configure_application(a).unwrap();
    assert!(manager.start_after_cycle("a").is_none());

    manager.configure_application(b.clone()).unwrap();
    assert_eq!(
        manager.start_after_cycle("b"),
        Some(vec!["b".to_string(), "a".to_string()])
    );
    manager.configure_application(b).unwrap();

    let mut cycles = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let LifecycleEvent::StartAfterCycle { names, .. } = event {
            cycles.push(names);
        }
    }
    assert_eq!(
        cycles,
        vec![vec!["b-app".to_string(), "a-app".to_string()]]
    );
}

#[tokio::test]
async fn test_clashing_name_waits_for_owner_removal() {
    let fixture = Fixture::new(MonitorTrigger::External);
    let manager = running(&fixture, "a").await;
    fixture.artifact("b");

    let mut b = app_config("b");
    b.name = Some("a-app".to_string());
    let b_started = manager.configure_application(b).unwrap();
    let mut c = app_config("c");
    c.name = Some("a-app".to_string());
    let c_started = manager.configure_application(c).unwrap();

    assert!(manager.machine("b").is_none());
    assert_eq!(
        manager.blocked_applications(),
        vec!["b".to_string(), "c".to_string()]
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(b_started.is_pending());

    let removed = manager.uninstall_application("a", false).unwrap();
    assert!(outcome_of(&removed).await.unwrap());
    assert!(outcome_of(&b_started).await.unwrap());
    assert!(manager.machine("b").is_some());

    // c now waits for b, and can be dropped while blocked
    assert_eq!(manager.blocked_applications(), vec!["c".to_string()]);
    let dropped = manager.uninstall_application("c", false).unwrap();
    assert!(outcome_of(&dropped).await.unwrap());
    let err = outcome_of(&c_started).await.unwrap_err();
    assert!(matches!(*err, AppManagerError::AlreadyRemoved { .. }));
    assert!(manager.blocked_applications().is_empty());
}

#[tokio::test]
async fn test_reconfigure_during_removal_keeps_new_instance() {
    let fixture = Fixture::new(MonitorTrigger::External);
    fixture.artifact("web");
    let manager = fixture.manager().await;
    let handler = ScriptedHandler::new();
    manager.register_handler("war", handler.clone());
    manager.start_applications();

    let started = manager.configure_application(app_config("web")).unwrap();
    assert!(outcome_of(&started).await.unwrap());
    let old = manager.machine("web").unwrap();

    handler.set_uninstall(Reply::Manual);
    let removed = manager.uninstall_application("web", true).unwrap();
    wait_until("old instance stopping", || handler.uninstall_count() == 1).await;

    let restarted = manager.configure_application(app_config("web")).unwrap();
    assert!(outcome_of(&restarted).await.unwrap());
    let new = manager.machine("web").unwrap();
    assert!(!new.same_machine(&old));
    std::fs::create_dir_all(fixture.cache_dir("web")).unwrap();

    for pending in handler.take_pending_uninstalls() {
        pending.resolve(true);
    }
    assert!(outcome_of(&removed).await.unwrap());
    assert_eq!(old.state(), InternalState::Removed);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(new.state(), InternalState::Started);
    assert_eq!(
        manager.application_state("web"),
        Some(ApplicationState::Started)
    );
    assert!(fixture.cache_dir("web").exists());
    assert!(manager.registry().is_live("web"));

    handler.set_uninstall(Reply::Succeed);
    manager.restart("web").unwrap();
    wait_until("new instance restarted", || handler.install_count() == 3).await;
    wait_until("new instance started", || new.state() == InternalState::Started).await;
}

#[tokio::test]
async fn test_late_handler_registration_starts_application() {
    let fixture = Fixture::new(MonitorTrigger::External);
    fixture.artifact("web");
    let manager = fixture.manager().await;
    manager.start_applications();

    let started = manager.configure_application(app_config("web")).unwrap();
    let machine = manager.machine("web").unwrap();
    assert_eq!(machine.state(), InternalState::Stopped);
    assert!(machine.is_blocked());

    manager.register_handler("war", marker_handler());
    assert!(outcome_of(&started).await.unwrap());
    assert!(fixture.marker("web").exists());
}

#[tokio::test]
async fn test_unregistered_handler_recycles_applications() {
    let fixture = Fixture::new(MonitorTrigger::External);
    let manager = running(&fixture, "web").await;
    let machine = manager.machine("web").unwrap();

    assert!(manager.unregister_handler("war").is_some());
    assert!(manager.unregister_handler("war").is_none());
    wait_until("web stopped without handler", || {
        machine.state() == InternalState::Stopped && machine.is_blocked()
    })
    .await;
    assert!(!fixture.marker("web").exists());
    assert!(!manager.registry().is_live("web"));

    manager.register_handler("war", marker_handler());
    wait_until("web started again", || {
        machine.state() == InternalState::Started
    })
    .await;
    assert!(fixture.marker("web").exists());
}

#[tokio::test]
async fn test_recycle_applications() {
    let fixture = Fixture::new(MonitorTrigger::External);
    fixture.artifact("web");
    let manager = fixture.manager().await;
    let handler = ScriptedHandler::new();
    manager.register_handler("war", handler.clone());
    manager.start_applications();
    let started = manager.configure_application(app_config("web")).unwrap();
    assert!(outcome_of(&started).await.unwrap());
    let machine = manager.machine("web").unwrap();

    let stopped =
        manager.recycle_applications(Some(&["web".to_string(), "ghost".to_string()]));
    assert_eq!(stopped.len(), 1);
    assert!(outcome_of(&stopped[0]).await.unwrap());
    wait_until("web recycled", || {
        handler.install_count() == 2 && machine.state() == InternalState::Started
    })
    .await;
    assert_eq!(handler.uninstall_count(), 1);

    assert_eq!(manager.recycle_applications(None).len(), 1);
}

#[tokio::test]
async fn test_stop_and_start_by_pid() {
    let fixture = Fixture::new(MonitorTrigger::External);
    let manager = running(&fixture, "web").await;

    let stopped = manager.stop("web").unwrap();
    assert!(outcome_of(&stopped).await.unwrap());
    assert_eq!(
        manager.application_state("web"),
        Some(ApplicationState::Stopped)
    );
    assert!(!fixture.marker("web").exists());

    let started = manager.start("web").unwrap();
    assert!(outcome_of(&started).await.unwrap());
    assert!(fixture.marker("web").exists());
}

#[tokio::test]
async fn test_uninstall_cleans_cache() {
    let fixture = Fixture::new(MonitorTrigger::External);
    let manager = running(&fixture, "web").await;
    assert!(fixture.cache_dir("web").exists());

    let removed = manager.uninstall_application("web", true).unwrap();
    assert!(outcome_of(&removed).await.unwrap());
    assert!(!manager.registry().is_live("web"));
    wait_until("cache cleaned", || !fixture.cache_dir("web").exists()).await;
    wait_until("state forgotten", || manager.application_state("web").is_none()).await;

    assert!(matches!(
        manager.start("web"),
        Err(AppManagerError::UnknownApplication { .. })
    ));
    assert!(matches!(
        manager.uninstall_application("web", true),
        Err(AppManagerError::UnknownApplication { .. })
    ));
}

#[tokio::test]
async fn test_triggered_scan_finds_late_artifact() {
    let fixture = Fixture::new(MonitorTrigger::External);
    let manager = fixture.manager().await;
    manager.register_handler("war", marker_handler());
    manager.start_applications();

    let started = manager.configure_application(app_config("web")).unwrap();
    assert_eq!(manager.trigger_file_scan(), 0);
    assert!(started.is_pending());

    fixture.artifact("web");
    assert_eq!(manager.trigger_file_scan(), 1);
    assert!(outcome_of(&started).await.unwrap());
}

#[tokio::test]
async fn test_missing_artifact_fails_without_monitor() {
    let fixture = Fixture::new(MonitorTrigger::Disabled);
    let manager = fixture.manager().await;
    manager.register_handler("war", marker_handler());
    manager.start_applications();

    let started = manager.configure_application(app_config("web")).unwrap();
    let err = outcome_of(&started).await.unwrap_err();
    assert!(matches!(*err, AppManagerError::NotFound { .. }));
    assert_eq!(manager.trigger_file_scan(), 0);
    assert_eq!(
        manager.application_state("web"),
        Some(ApplicationState::Installed)
    );
    assert_eq!(manager.states().failure_count("web"), 1);
}

#[tokio::test]
async fn test_rejected_install_is_reported() {
    let fixture = Fixture::new(MonitorTrigger::External);
    fixture.artifact("web");
    let manager = fixture.manager().await;
    let handler = ScriptedHandler::new();
    handler.set_install(Reply::Reject);
    manager.register_handler("war", handler.clone());
    manager.start_applications();

    let started = manager.configure_application(app_config("web")).unwrap();
    assert!(outcome_of(&started).await.is_err());
    assert_eq!(handler.install_count(), 1);
    assert!(!manager.registry().is_live("web"));
}

#[tokio::test]
async fn test_summaries_and_describe() {
    let fixture = Fixture::new(MonitorTrigger::External);
    let manager = running(&fixture, "web").await;
    manager.configure_application(app_config("api")).unwrap();

    let summaries = manager.summaries();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].pid, "api");
    assert_eq!(summaries[1].pid, "web");
    assert_eq!(summaries[1].state, InternalState::Started);
    assert_eq!(summaries[1].external_state, Some(ApplicationState::Started));
    assert_eq!(summaries[1].app_type.as_deref(), Some("war"));

    let dump = manager.describe();
    assert!(dump.contains("Application web [STARTED]"));
    assert!(dump.contains("Application api"));
}

#[tokio::test]
async fn test_run_shuts_down_on_request() {
    let fixture = Fixture::new(MonitorTrigger::External);
    let mut manager = running(&fixture, "web").await;

    assert!(manager.request_shutdown(ShutdownReason::UserRequest).await);
    assert!(!manager.request_shutdown(ShutdownReason::UserRequest).await);

    let exit_code = manager.run().await.unwrap();
    assert_eq!(exit_code, 0);
    assert!(manager.pids().is_empty());
    assert!(!fixture.marker("web").exists());
    assert!(manager.registry().is_empty());
}
