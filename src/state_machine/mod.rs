//! Per-application lifecycle state machine.
//!
//! One [`ApplicationStateMachine`] exists per configured application. It
//! turns concurrently requested actions (configure, start, stop, restart,
//! remove) into a single ordered sequence of state entries and drives the
//! resolution, start and stop actions that move the application between
//! states.

mod driver;
mod entry;
mod machine;
mod types;


pub use machine::ApplicationStateMachine;
pub use types::{CallbackPhase, InternalState, QueuedAction, RequestedAction, SubActionOutcome};

use crate::config::ManagerConfig;
use crate::events::EventBus;
use crate::handler::{ApplicationHelper, ApplicationMonitor, ContainerFactory};
use crate::resolve::ResolverContext;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Execution contexts used by the machines
#[derive(Debug, Clone)]
pub struct Executors {
    /// Driver re-entry and sub-action work
    pub general: Handle,
    /// Delayed work such as the slow start watchdog
    pub scheduled: Handle,
}

impl Executors {
    pub fn new(general: Handle, scheduled: Handle) -> Self {
        Self { general, scheduled }
    }

    /// Both contexts on the current runtime
    pub fn current() -> Self {
        let handle = Handle::current();
        Self {
            general: handle.clone(),
            scheduled: handle,
        }
    }
}

/// Source of queued action sequence numbers, shared by the machines of one
/// factory
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter {
    last: Arc<AtomicU64>,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }
}

/// Timing knobs of a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineSettings {
    pub slow_start_timeout: Duration,
    pub restart_drain_timeout: Duration,
}

impl MachineSettings {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            slow_start_timeout: config.slow_start_timeout(),
            restart_drain_timeout: config.restart_drain_timeout(),
        }
    }
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            slow_start_timeout: Duration::from_secs(30),
            restart_drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Builds machines wired to one set of collaborators
pub struct StateMachineFactory {
    executors: Executors,
    events: EventBus,
    resolver: Arc<ResolverContext>,
    containers: Arc<dyn ContainerFactory>,
    monitor: Arc<dyn ApplicationMonitor>,
    settings: MachineSettings,
    sequence: SequenceCounter,
}

impl StateMachineFactory {
    pub fn new(
        executors: Executors,
        events: EventBus,
        resolver: Arc<ResolverContext>,
        containers: Arc<dyn ContainerFactory>,
        monitor: Arc<dyn ApplicationMonitor>,
        settings: MachineSettings,
    ) -> Self {
        Self {
            executors,
            events,
            resolver,
            containers,
            monitor,
            settings,
            sequence: SequenceCounter::new(),
        }
    }

    pub fn sequence(&self) -> &SequenceCounter {
        &self.sequence
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// New machine in `INITIAL` for `pid`
    pub fn create(
        &self,
        pid: impl Into<String>,
        helper: Arc<dyn ApplicationHelper>,
    ) -> ApplicationStateMachine {
        ApplicationStateMachine::new(
            pid.into(),
            self.executors.clone(),
            self.events.clone(),
            Arc::clone(&self.resolver),
            Arc::clone(&self.containers),
            Arc::clone(&self.monitor),
            helper,
            self.settings,
            self.sequence.clone(),
        )
    }
}
