pub mod actions;
pub mod app;
pub mod cache;
pub mod config;
pub mod dependency;
pub mod error;
pub mod events;
pub mod handler;
pub mod monitor;
pub mod resolve;
pub mod state_machine;

#[cfg(test)]
mod test_support;

pub use app::{AppManager, AppStates, ApplicationSummary, MarkerFileHandler, MonitorRegistry, ShutdownReason};
pub use config::{ApplicationConfig, ManagerConfig, MonitorTrigger};
pub use dependency::{
    ApplicationDependency, CancelableListener, Dependency, GateWaiter, ListenerId, Outcome,
};
pub use error::{AppManagerError, Cause, EventBusError, Result};
pub use events::{EventBus, EventFilter, EventReceiver, LifecycleEvent};
pub use handler::{
    ApplicationHandler, ApplicationHelper, ApplicationMonitor, ApplicationState, Container,
    ContainerFactory, DirectoryContainerFactory, InstallInfo, MonitoringInfo,
};
pub use state_machine::{
    ApplicationStateMachine, Executors, InternalState, MachineSettings, RequestedAction,
    StateMachineFactory,
};
