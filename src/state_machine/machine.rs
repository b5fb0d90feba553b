use super::types::{CallbackPhase, InternalState, QueuedAction, RequestedAction};
use super::{Executors, MachineSettings, SequenceCounter};
use crate::actions::{StartAction, StopAction};
use crate::config::ApplicationConfig;
use crate::dependency::{ApplicationDependency, Dependency, GateWaiter};
use crate::error::{AppManagerError, Cause, Result};
use crate::events::EventBus;
use crate::handler::{
    same_handler, ApplicationHandler, ApplicationHelper, ApplicationMonitor, Container,
    ContainerFactory, InstallInfo,
};
use crate::resolve::{ContainerBuilder, ResolverContext, ResourceAction};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

/// What a state entry or performed action leaves the machine doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Step {
    /// Enter this state next, on the same thread
    Enter(InternalState),
    /// Nothing running; queued actions may be applied
    Idle,
    /// A start or stop callback is outstanding; queued actions wait for it
    Parked,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct ActiveCallback {
    pub generation: u64,
    pub phase: CallbackPhase,
}

/// Interruptibility bookkeeping, guarded as one unit
pub(super) struct Control {
    pub interruptible: bool,
    /// Driver token: held by whichever thread runs an entry or action
    pub executing: bool,
    pub driver_scheduled: bool,
    pub queue: VecDeque<QueuedAction>,
    pub callback: Option<ActiveCallback>,
    pub generation: u64,
    pub remove_requested: bool,
    pub pending_config: Option<Arc<ApplicationConfig>>,
}

#[derive(Default)]
pub(super) struct Runtime {
    pub config: Option<Arc<ApplicationConfig>>,
    pub handler: Option<Arc<dyn ApplicationHandler>>,
    pub resolved: Option<(Container, PathBuf)>,
    pub install_info: Option<Arc<InstallInfo>>,
    pub failure: Option<Cause>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Milestone {
    Stopped,
    Starting,
    InstallCalled,
    Started,
    Removed,
}

#[derive(Default)]
pub(super) struct Milestones {
    stopped: Vec<ApplicationDependency>,
    starting: Vec<ApplicationDependency>,
    install_called: Vec<ApplicationDependency>,
    started: Vec<ApplicationDependency>,
    removed: Vec<ApplicationDependency>,
}

impl Milestones {
    fn list(&mut self, milestone: Milestone) -> &mut Vec<ApplicationDependency> {
        match milestone {
            Milestone::Stopped => &mut self.stopped,
            Milestone::Starting => &mut self.starting,
            Milestone::InstallCalled => &mut self.install_called,
            Milestone::Started => &mut self.started,
            Milestone::Removed => &mut self.removed,
        }
    }

    pub fn take(&mut self, milestone: Milestone) -> Vec<ApplicationDependency> {
        std::mem::take(self.list(milestone))
    }

    fn counts(&self) -> [usize; 5] {
        [
            self.stopped.len(),
            self.starting.len(),
            self.install_called.len(),
            self.started.len(),
            self.removed.len(),
        ]
    }
}

#[derive(Default)]
pub(super) struct Gates {
    pub start: Vec<ApplicationDependency>,
    pub start_after: Vec<ApplicationDependency>,
    pub explicit_start: Option<ApplicationDependency>,
    pub handler: Option<ApplicationDependency>,
}

impl Gates {
    /// Add gates not already held; the same cell handed in twice is kept once
    pub fn merge(held: &mut Vec<ApplicationDependency>, gates: Vec<ApplicationDependency>) {
        for gate in gates {
            if !held.iter().any(|existing| existing.ptr_eq(&gate)) {
                held.push(gate);
            }
        }
    }

    /// Unresolved gates that hold back the start from `STOPPED`
    pub fn readiness_pending(&mut self) -> Vec<ApplicationDependency> {
        self.start.retain(Dependency::is_pending);
        self.start_after.retain(Dependency::is_pending);
        self.start
            .iter()
            .chain(self.start_after.iter())
            .chain(self.explicit_start.iter())
            .filter(|gate| gate.is_pending())
            .cloned()
            .collect()
    }

    fn any_pending(&self) -> bool {
        self.start
            .iter()
            .chain(self.start_after.iter())
            .chain(self.explicit_start.iter())
            .chain(self.handler.iter())
            .any(Dependency::is_pending)
    }
}

/// Sub-action whose completion the machine is waiting for
pub(super) enum InFlight {
    Nothing,
    Resolve(Arc<ResourceAction>),
    Start(Arc<StartAction>),
    Stop(Arc<StopAction>),
    Gates(GateWaiter),
}

impl InFlight {
    pub fn cancel(self) {
        match self {
            InFlight::Nothing => {}
            InFlight::Resolve(action) => action.cancel(),
            InFlight::Start(action) => action.cancel(),
            InFlight::Stop(action) => action.cancel(),
            InFlight::Gates(waiter) => {
                waiter.cancel();
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            InFlight::Nothing => "none",
            InFlight::Resolve(_) => "resolution",
            InFlight::Start(_) => "start",
            InFlight::Stop(_) => "stop",
            InFlight::Gates(_) => "start gates",
        }
    }
}

pub(super) struct MachineInner {
    pub pid: String,
    pub executors: Executors,
    pub events: EventBus,
    pub resolver: Arc<ResolverContext>,
    pub containers: Arc<dyn ContainerFactory>,
    pub monitor: Arc<dyn ApplicationMonitor>,
    pub helper: Arc<dyn ApplicationHelper>,
    pub settings: MachineSettings,
    pub sequence: SequenceCounter,
    pub control: Mutex<Control>,
    pub state: Mutex<InternalState>,
    pub runtime: Mutex<Runtime>,
    pub milestones: Mutex<Milestones>,
    pub gates: Mutex<Gates>,
    pub in_flight: Mutex<InFlight>,
    pub in_entry: AtomicBool,
    pub drained: Notify,
}

/// Lifecycle controller for one application.
///
/// Cloning yields another handle onto the same machine. Every operation may
/// be called from any thread; results are delivered through the returned
/// dependencies.
#[derive(Clone)]
pub struct ApplicationStateMachine {
    inner: Arc<MachineInner>,
}

impl ApplicationStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        pid: String,
        executors: Executors,
        events: EventBus,
        resolver: Arc<ResolverContext>,
        containers: Arc<dyn ContainerFactory>,
        monitor: Arc<dyn ApplicationMonitor>,
        helper: Arc<dyn ApplicationHelper>,
        settings: MachineSettings,
        sequence: SequenceCounter,
    ) -> Self {
        debug!("Creating state machine for {}", pid);
        Self {
            inner: Arc::new(MachineInner {
                pid,
                executors,
                events,
                resolver,
                containers,
                monitor,
                helper,
                settings,
                sequence,
                control: Mutex::new(Control {
                    interruptible: true,
                    executing: false,
                    driver_scheduled: false,
                    queue: VecDeque::new(),
                    callback: None,
                    generation: 0,
                    remove_requested: false,
                    pending_config: None,
                }),
                state: Mutex::new(InternalState::Initial),
                runtime: Mutex::new(Runtime::default()),
                milestones: Mutex::new(Milestones::default()),
                gates: Mutex::new(Gates::default()),
                in_flight: Mutex::new(InFlight::Nothing),
                in_entry: AtomicBool::new(false),
                drained: Notify::new(),
            }),
        }
    }

    pub fn pid(&self) -> &str {
        &self.inner.pid
    }

    /// True when both handles control the same machine
    pub fn same_machine(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> InternalState {
        self.inner.state()
    }

    /// Snapshot of the queued actions, oldest first
    pub fn queued_actions(&self) -> Vec<QueuedAction> {
        self.inner.control.lock().queue.iter().copied().collect()
    }

    /// Current configuration, if one has been adopted
    pub fn config(&self) -> Option<Arc<ApplicationConfig>> {
        self.inner.runtime.lock().config.clone()
    }

    /// Request a start. Resolves once the application has started.
    ///
    /// An explicit start overrides automatic sequencing, so pending
    /// explicit-start and start-after gates are released.
    pub fn start(&self) -> ApplicationDependency {
        let started = Dependency::new(format!("{} started", self.inner.pid));
        self.inner.register(Milestone::Started, started.clone());
        self.inner.release_start_gates();
        self.inner.attempt(RequestedAction::Start, None);
        started
    }

    /// Request a stop. Resolves once the application has stopped.
    ///
    /// The machine then stays stopped until the next explicit `start`.
    pub fn stop(&self) -> ApplicationDependency {
        let stopped = Dependency::new(format!("{} stopped", self.inner.pid));
        self.inner.register(Milestone::Stopped, stopped.clone());
        self.inner.arm_explicit_start_gate();
        self.inner.attempt(RequestedAction::Stop, None);
        stopped
    }

    /// Stop and start again once queued work has drained
    pub fn restart(&self) {
        self.inner.restart();
    }

    /// Supply, replace or revoke the handler.
    ///
    /// Revoking (`None`) holds the next start until a handler is bound again
    /// and abandons a pending resolution or gate wait. An install or
    /// uninstall call already made on the old handler is not cancelled; it
    /// runs to completion and its result is applied. Binding a different
    /// handler to a configured machine restarts it.
    pub fn set_app_handler(&self, handler: Option<Arc<dyn ApplicationHandler>>) {
        let inner = &self.inner;
        {
            let mut runtime = inner.runtime.lock();
            match (&runtime.handler, &handler) {
                (Some(current), Some(new)) if same_handler(current, new) => return,
                (None, None) => return,
                _ => {}
            }
            runtime.handler = handler.clone();
        }

        match handler {
            None => {
                info!("Handler for {} removed", inner.pid);
                inner.arm_handler_gate();
                inner.cancel_interruptible_wait();
            }
            Some(handler) => {
                info!("Handler {} bound to {}", handler.name(), inner.pid);
                let gate = inner.gates.lock().handler.take();
                if let Some(gate) = gate {
                    gate.resolve(true);
                }
                if inner.state() != InternalState::Initial {
                    inner.restart();
                }
            }
        }
    }

    /// Supply a new configuration and the dependencies tied to it.
    ///
    /// Only one `CONFIGURE` is ever queued; a later call before it runs
    /// replaces the configuration it will adopt.
    #[allow(clippy::too_many_arguments)]
    pub fn configure(
        &self,
        config: ApplicationConfig,
        start_gates: Vec<ApplicationDependency>,
        start_after_gates: Vec<ApplicationDependency>,
        on_stopped: Option<ApplicationDependency>,
        on_starting: Option<ApplicationDependency>,
        on_install_called: Option<ApplicationDependency>,
        on_started: Option<ApplicationDependency>,
    ) {
        let inner = &self.inner;
        {
            let mut gates = inner.gates.lock();
            Gates::merge(&mut gates.start, start_gates);
            Gates::merge(&mut gates.start_after, start_after_gates);
        }
        if !config.auto_start {
            inner.arm_explicit_start_gate();
        }
        inner.register_all(&[
            (Milestone::Stopped, on_stopped),
            (Milestone::Starting, on_starting),
            (Milestone::InstallCalled, on_install_called),
            (Milestone::Started, on_started),
        ]);
        debug!("Configuration received for {}", inner.pid);
        inner.attempt(RequestedAction::Configure, Some(Arc::new(config)));
    }

    /// Stop and start again because the artifact changed
    pub fn recycle(
        &self,
        start_gates: Vec<ApplicationDependency>,
        on_stopped: Option<ApplicationDependency>,
        on_install_called: Option<ApplicationDependency>,
        on_started: Option<ApplicationDependency>,
    ) {
        let inner = &self.inner;
        Gates::merge(&mut inner.gates.lock().start, start_gates);
        inner.register_all(&[
            (Milestone::Stopped, on_stopped),
            (Milestone::InstallCalled, on_install_called),
            (Milestone::Started, on_started),
        ]);
        info!("Recycling {}", inner.pid);
        inner.restart();
    }

    /// Schedule removal. Fails if the machine has already been removed.
    pub fn uninstall(&self, on_removed: Option<ApplicationDependency>) -> Result<ApplicationDependency> {
        let inner = &self.inner;
        let removed =
            on_removed.unwrap_or_else(|| Dependency::new(format!("{} removed", inner.pid)));
        {
            let mut milestones = inner.milestones.lock();
            if inner.state() == InternalState::Removed {
                return Err(AppManagerError::AlreadyRemoved {
                    pid: inner.pid.clone(),
                });
            }
            milestones.list(Milestone::Removed).push(removed.clone());
        }
        info!("Uninstall requested for {}", inner.pid);
        inner.attempt(RequestedAction::Remove, None);
        Ok(removed)
    }

    /// True while any start gate, including the handler gate, is unresolved
    pub fn is_blocked(&self) -> bool {
        self.inner.gates.lock().any_pending()
    }

    /// Diagnostic dump, no side effects
    pub fn describe(&self, buffer: &mut String) {
        let inner = &self.inner;
        let state = inner.state();
        let (interruptible, executing, queue, callback) = {
            let control = inner.control.lock();
            (
                control.interruptible,
                control.executing,
                control
                    .queue
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>(),
                control.callback,
            )
        };
        let (location, handler) = {
            let runtime = inner.runtime.lock();
            (
                runtime
                    .config
                    .as_ref()
                    .and_then(|c| c.location.clone())
                    .unwrap_or_else(|| "<unconfigured>".to_string()),
                runtime
                    .handler
                    .as_ref()
                    .map(|h| h.name().to_string())
                    .unwrap_or_else(|| "<none>".to_string()),
            )
        };
        let in_flight = inner.in_flight.lock().label();
        let counts = inner.milestones.lock().counts();

        let _ = writeln!(buffer, "Application {} [{}]", inner.pid, state);
        let _ = writeln!(buffer, "  location: {}", location);
        let _ = writeln!(buffer, "  handler: {}", handler);
        let _ = writeln!(
            buffer,
            "  interruptible: {}, executing: {}, blocked: {}",
            interruptible,
            executing,
            self.is_blocked()
        );
        let _ = writeln!(buffer, "  queued: [{}]", queue.join(", "));
        match callback {
            Some(callback) => {
                let _ = writeln!(
                    buffer,
                    "  in flight: {} (callback #{} {:?})",
                    in_flight, callback.generation, callback.phase
                );
            }
            None => {
                let _ = writeln!(buffer, "  in flight: {}", in_flight);
            }
        }
        let _ = writeln!(
            buffer,
            "  waiting: stopped={} starting={} install_called={} started={} removed={}",
            counts[0], counts[1], counts[2], counts[3], counts[4]
        );
    }
}

impl MachineInner {
    pub fn state(&self) -> InternalState {
        *self.state.lock()
    }

    /// Record a milestone dependency, completing it at once if the machine
    /// can no longer reach the milestone
    pub fn register(&self, milestone: Milestone, dependency: ApplicationDependency) {
        let mut milestones = self.milestones.lock();
        if self.state() == InternalState::Removed {
            drop(milestones);
            match milestone {
                Milestone::Starting | Milestone::Started => {
                    dependency.fail(
                        AppManagerError::AlreadyRemoved {
                            pid: self.pid.clone(),
                        }
                        .into_cause(),
                    );
                }
                _ => {
                    dependency.resolve(true);
                }
            }
            return;
        }
        milestones.list(milestone).push(dependency);
    }

    fn register_all(&self, dependencies: &[(Milestone, Option<ApplicationDependency>)]) {
        for (milestone, dependency) in dependencies {
            if let Some(dependency) = dependency {
                self.register(*milestone, dependency.clone());
            }
        }
    }

    pub fn resolve_milestone(&self, milestone: Milestone) {
        let pending = self.milestones.lock().take(milestone);
        for dependency in pending {
            dependency.resolve(true);
        }
    }

    pub fn fail_milestone(&self, milestone: Milestone, cause: &Cause) {
        let pending = self.milestones.lock().take(milestone);
        for dependency in pending {
            dependency.fail(Arc::clone(cause));
        }
    }

    fn release_start_gates(&self) {
        let released: Vec<ApplicationDependency> = {
            let mut gates = self.gates.lock();
            let mut released: Vec<ApplicationDependency> = gates.start_after.drain(..).collect();
            released.extend(gates.explicit_start.take());
            released
        };
        for gate in released {
            gate.resolve(true);
        }
    }

    pub fn arm_explicit_start_gate(&self) {
        let mut gates = self.gates.lock();
        if !gates.explicit_start.as_ref().is_some_and(Dependency::is_pending) {
            gates.explicit_start = Some(Dependency::new(format!(
                "explicit start of {}",
                self.pid
            )));
        }
    }

    pub fn arm_handler_gate(&self) {
        let mut gates = self.gates.lock();
        if !gates.handler.as_ref().is_some_and(Dependency::is_pending) {
            gates.handler = Some(Dependency::new(format!("handler for {}", self.pid)));
        }
    }

    /// Builds containers under this application's cache directories
    pub fn container_builder(&self) -> ContainerBuilder {
        let cache = self.resolver.cache.clone();
        let containers = Arc::clone(&self.containers);
        let pid = self.pid.clone();
        Arc::new(move |path: &Path| {
            let dirs = cache.ensure_dirs(&pid)?;
            containers
                .get_container(&dirs, path)
                .ok_or_else(|| AppManagerError::ContainerUnavailable {
                    path: path.to_path_buf(),
                })
        })
    }
}
