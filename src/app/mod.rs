//! Application manager: owns the per-application state machines, binds
//! handlers to them by type and drives the process lifecycle.

mod marker;
mod orchestrator;
mod runtime;
mod shutdown;
mod startup;
mod state;
mod table;
mod types;

#[cfg(test)]
mod tests;

pub use marker::{MarkerFileHandler, MARKER_FILE};
pub use orchestrator::AppManager;
pub use state::{AppStates, MonitorRegistry, MonitoredApplication};
pub use types::{ApplicationSummary, ShutdownReason};
