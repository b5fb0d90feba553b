use crate::handler::ApplicationState;
use crate::state_machine::InternalState;
use serde::Serialize;

/// System shutdown reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(String),
    UserRequest,
}

/// Point-in-time view of one managed application
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationSummary {
    pub pid: String,
    pub name: Option<String>,
    pub app_type: Option<String>,
    pub state: InternalState,
    pub external_state: Option<ApplicationState>,
    pub blocked: bool,
}
