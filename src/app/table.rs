//! Configured applications, keyed by pid, and the handlers bound to them.

use super::state::AppStates;
use crate::cache::CacheLayout;
use crate::config::ApplicationConfig;
use crate::dependency::{ApplicationDependency, Dependency};
use crate::error::{AppManagerError, Result};
use crate::events::{EventBus, LifecycleEvent};
use crate::handler::ApplicationHandler;
use crate::state_machine::{ApplicationStateMachine, StateMachineFactory};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

pub(super) struct ManagedApplication {
    pub machine: ApplicationStateMachine,
    pub name: Option<String>,
    pub app_type: String,
    pub start_after: Vec<String>,
}

impl ManagedApplication {
    fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.machine.pid().to_string())
    }
}

/// Configuration parked until its name is released by another application
struct BlockedApplication {
    config: ApplicationConfig,
    started: ApplicationDependency,
}

/// Lock order: `applications`, then `handlers` or `releasing`. `blocked`
/// and `reported_cycles` are never held together with another lock.
pub(super) struct ApplicationTable {
    pub factory: StateMachineFactory,
    pub states: Arc<AppStates>,
    pub cache: CacheLayout,
    pub events: EventBus,
    pub executor: Handle,
    /// Start gate shared by every application, resolved by `start_applications`
    pub ready: ApplicationDependency,

    pub applications: Mutex<HashMap<String, ManagedApplication>>,
    handlers: Mutex<HashMap<String, Arc<dyn ApplicationHandler>>>,
    /// Names still held by an application whose removal is in progress
    releasing: Mutex<HashMap<String, String>>,
    blocked: Mutex<Vec<BlockedApplication>>,
    reported_cycles: Mutex<HashSet<Vec<String>>>,
}

impl ApplicationTable {
    pub fn new(
        factory: StateMachineFactory,
        states: Arc<AppStates>,
        cache: CacheLayout,
        events: EventBus,
        executor: Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            states,
            cache,
            events,
            executor,
            ready: Dependency::new("application manager ready"),
            applications: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            releasing: Mutex::new(HashMap::new()),
            blocked: Mutex::new(Vec::new()),
            reported_cycles: Mutex::new(HashSet::new()),
        })
    }

    /// Add or update an application. A configuration whose name belongs to
    /// another pid is parked until that application is removed.
    pub fn configure(
        &self,
        config: ApplicationConfig,
        started: Option<ApplicationDependency>,
    ) -> Result<ApplicationDependency> {
        config.validate()?;
        let pid = config.pid.clone();
        let app_type = config.app_type().to_string();

        let parked = self.take_blocked(&pid);
        let started = started
            .or(parked)
            .unwrap_or_else(|| Dependency::new(format!("{} started", config.label())));

        let (machine, handler) = {
            let mut applications = self.applications.lock();
            let owner = self.name_owner(&applications, &config);
            if let Some(owner) = owner {
                info!(
                    "{} is blocked until {} releases the name '{}'",
                    config.label(),
                    owner,
                    config.name.as_deref().unwrap_or_default()
                );
                drop(applications);
                self.blocked.lock().push(BlockedApplication {
                    config,
                    started: started.clone(),
                });
                return Ok(started);
            }

            let app = applications.entry(pid.clone()).or_insert_with(|| {
                info!("Adding {}", config.label());
                ManagedApplication {
                    machine: self
                        .factory
                        .create(pid.clone(), self.states.helper_for(&pid)),
                    name: None,
                    app_type: app_type.clone(),
                    start_after: Vec::new(),
                }
            });
            app.name = config.name.clone();
            app.app_type = app_type.clone();
            app.start_after = config.start_after.clone();
            self.states.set_app_type(&pid, &app_type);
            let handler = self.handlers.lock().get(&app_type).cloned();
            (app.machine.clone(), handler)
        };

        let start_after = config
            .start_after
            .iter()
            .map(|other| {
                if !self.applications.lock().contains_key(other) {
                    debug!("{} waits for {}, which is not configured yet", pid, other);
                }
                self.states.started_gate(other)
            })
            .collect();
        self.report_cycle(&pid);

        machine.set_app_handler(handler);
        machine.configure(
            config,
            vec![self.ready.clone()],
            start_after,
            None,
            None,
            None,
            Some(started.clone()),
        );
        Ok(started)
    }

    /// Pid holding the name `config` asks for, when it is not `config.pid`
    fn name_owner(
        &self,
        applications: &HashMap<String, ManagedApplication>,
        config: &ApplicationConfig,
    ) -> Option<String> {
        let name = config.name.as_ref()?;
        let live = applications
            .iter()
            .find(|(other, app)| *other != &config.pid && app.name.as_ref() == Some(name))
            .map(|(other, _)| other.clone());
        live.or_else(|| {
            self.releasing
                .lock()
                .get(name)
                .filter(|owner| *owner != &config.pid)
                .cloned()
        })
    }

    fn take_blocked(&self, pid: &str) -> Option<ApplicationDependency> {
        let mut blocked = self.blocked.lock();
        let index = blocked.iter().position(|b| b.config.pid == pid)?;
        Some(blocked.remove(index).started)
    }

    pub fn blocked_pids(&self) -> Vec<String> {
        self.blocked
            .lock()
            .iter()
            .map(|b| b.config.pid.clone())
            .collect()
    }

    /// Drop every parked configuration, failing its started dependency
    pub fn discard_blocked(&self) -> usize {
        let blocked = std::mem::take(&mut *self.blocked.lock());
        for BlockedApplication { config, started } in &blocked {
            started.fail(
                AppManagerError::AlreadyRemoved {
                    pid: config.pid.clone(),
                }
                .into_cause(),
            );
        }
        blocked.len()
    }

    /// Start-after chain leading from `pid` back to an application on it
    pub fn start_after_cycle(&self, pid: &str) -> Option<Vec<String>> {
        let applications = self.applications.lock();
        let mut path = vec![pid.to_string()];
        find_cycle(&applications, pid, &mut path)
    }

    fn report_cycle(&self, pid: &str) {
        let Some(cycle) = self.start_after_cycle(pid) else {
            return;
        };
        let mut key = cycle.clone();
        key.sort();
        if !self.reported_cycles.lock().insert(key) {
            return;
        }
        let names = {
            let applications = self.applications.lock();
            cycle
                .iter()
                .map(|member| {
                    applications
                        .get(member)
                        .map_or_else(|| member.clone(), ManagedApplication::display_name)
                })
                .collect()
        };
        self.events.publish(LifecycleEvent::StartAfterCycle {
            pid: pid.to_string(),
            names,
        });
    }

    pub fn register_handler(&self, app_type: &str, handler: Arc<dyn ApplicationHandler>) {
        info!("Registering {} for type '{}'", handler.name(), app_type);
        self.handlers
            .lock()
            .insert(app_type.to_string(), Arc::clone(&handler));
        for machine in self.machines_of_type(app_type) {
            machine.set_app_handler(Some(Arc::clone(&handler)));
        }
    }

    /// Revoke the handler and recycle its applications, which then wait
    /// stopped until a handler for the type is registered again
    pub fn unregister_handler(&self, app_type: &str) -> Option<Arc<dyn ApplicationHandler>> {
        let removed = self.handlers.lock().remove(app_type)?;
        info!("Unregistered {} for type '{}'", removed.name(), app_type);
        for machine in self.machines_of_type(app_type) {
            machine.set_app_handler(None);
            recycle(&machine);
        }
        Some(removed)
    }

    fn machines_of_type(&self, app_type: &str) -> Vec<ApplicationStateMachine> {
        self.applications
            .lock()
            .values()
            .filter(|app| app.app_type == app_type)
            .map(|app| app.machine.clone())
            .collect()
    }

    /// Recycle the named applications, or every application for `None`.
    /// Unknown pids are skipped. Returns the stopped milestone of each
    /// recycled application.
    pub fn recycle_applications(&self, pids: Option<&[String]>) -> Vec<ApplicationDependency> {
        let machines: Vec<ApplicationStateMachine> = {
            let applications = self.applications.lock();
            match pids {
                None => applications.values().map(|app| app.machine.clone()).collect(),
                Some(pids) => pids
                    .iter()
                    .filter_map(|pid| applications.get(pid).map(|app| app.machine.clone()))
                    .collect(),
            }
        };
        machines.iter().map(recycle).collect()
    }

    pub fn machine(&self, pid: &str) -> Option<ApplicationStateMachine> {
        self.applications
            .lock()
            .get(pid)
            .map(|app| app.machine.clone())
    }

    /// Remove an application. The pid is unknown from this call on; its
    /// name, external state and cache are released once removal completes.
    pub fn uninstall(self: &Arc<Self>, pid: &str, clean_cache: bool) -> Result<ApplicationDependency> {
        let Some(machine) = self.machine(pid) else {
            return match self.take_blocked(pid) {
                Some(started) => {
                    info!("Discarding blocked configuration of {}", pid);
                    started.fail(
                        AppManagerError::AlreadyRemoved {
                            pid: pid.to_string(),
                        }
                        .into_cause(),
                    );
                    Ok(Dependency::resolved(format!("{} removed", pid), true))
                }
                None => Err(AppManagerError::UnknownApplication {
                    pid: pid.to_string(),
                }),
            };
        };
        let removed = machine.uninstall(None)?;

        let name = {
            let mut applications = self.applications.lock();
            let owned = applications
                .get(pid)
                .is_some_and(|app| app.machine.same_machine(&machine));
            let name = if owned {
                applications.remove(pid).and_then(|app| app.name)
            } else {
                None
            };
            if let Some(name) = &name {
                self.releasing.lock().insert(name.clone(), pid.to_string());
            }
            name
        };

        let table = Arc::clone(self);
        let pid = pid.to_string();
        let waiter = removed.clone();
        self.executor.spawn(async move {
            if let Err(e) = waiter.wait().await {
                warn!("Removal of {} did not complete cleanly: {}", pid, e);
            }
            table.finish_removal(&pid, name, clean_cache);
        });
        Ok(removed)
    }

    fn finish_removal(&self, pid: &str, name: Option<String>, clean_cache: bool) {
        {
            let applications = self.applications.lock();
            if applications.contains_key(pid) {
                debug!("{} was configured again during its removal, keeping its state", pid);
            } else {
                self.states.forget(pid);
                if clean_cache {
                    if let Err(e) = self.cache.clean(pid) {
                        warn!("Failed to clean cache for {}: {}", pid, e);
                    }
                }
            }
        }

        let Some(name) = name else {
            return;
        };
        {
            let mut releasing = self.releasing.lock();
            if releasing.get(&name).map(String::as_str) == Some(pid) {
                releasing.remove(&name);
            }
        }

        let next = {
            let mut blocked = self.blocked.lock();
            let index = blocked
                .iter()
                .position(|b| b.config.name.as_ref() == Some(&name));
            index.map(|index| blocked.remove(index))
        };
        if let Some(BlockedApplication { config, started }) = next {
            info!("Name '{}' released, configuring {}", name, config.label());
            if let Err(e) = self.configure(config, Some(started.clone())) {
                started.fail(e.into_cause());
            }
        }
    }
}

fn recycle(machine: &ApplicationStateMachine) -> ApplicationDependency {
    let stopped = Dependency::new(format!("{} stopped for recycle", machine.pid()));
    let install_called = Dependency::new(format!("{} install called", machine.pid()));
    machine.recycle(Vec::new(), Some(stopped.clone()), Some(install_called), None);
    stopped
}

fn find_cycle(
    applications: &HashMap<String, ManagedApplication>,
    current: &str,
    path: &mut Vec<String>,
) -> Option<Vec<String>> {
    let app = applications.get(current)?;
    for next in &app.start_after {
        if !applications.contains_key(next) {
            continue;
        }
        if let Some(at) = path.iter().position(|member| member == next) {
            return Some(path[at..].to_vec());
        }
        path.push(next.clone());
        if let Some(cycle) = find_cycle(applications, next, path) {
            return Some(cycle);
        }
        path.pop();
    }
    None
}
