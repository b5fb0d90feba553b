use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal lifecycle state of one application instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InternalState {
    Initial,
    Stopped,
    Starting,
    Started,
    Stopping,
    Failed,
    Removed,
}

impl InternalState {
    /// True for the states an external action can be applied to directly
    pub fn is_stable(self) -> bool {
        !matches!(self, InternalState::Starting | InternalState::Stopping)
    }

    /// Whether the edge `self -> next` is one the machine may take
    pub fn can_transition_to(self, next: InternalState) -> bool {
        use InternalState::*;
        matches!(
            (self, next),
            (Initial, Stopped)
                | (Initial, Removed)
                | (Stopped, Stopped)
                | (Stopped, Starting)
                | (Stopped, Failed)
                | (Stopped, Removed)
                | (Starting, Started)
                | (Starting, Failed)
                | (Started, Started)
                | (Started, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                | (Failed, Stopped)
                | (Failed, Removed)
        )
    }
}

impl fmt::Display for InternalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InternalState::Initial => "INITIAL",
            InternalState::Stopped => "STOPPED",
            InternalState::Starting => "STARTING",
            InternalState::Started => "STARTED",
            InternalState::Stopping => "STOPPING",
            InternalState::Failed => "FAILED",
            InternalState::Removed => "REMOVED",
        };
        f.write_str(name)
    }
}

/// Externally requested transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestedAction {
    Configure,
    Start,
    Stop,
    Restart,
    Remove,
}

impl fmt::Display for RequestedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestedAction::Configure => "CONFIGURE",
            RequestedAction::Start => "START",
            RequestedAction::Stop => "STOP",
            RequestedAction::Restart => "RESTART",
            RequestedAction::Remove => "REMOVE",
        };
        f.write_str(name)
    }
}

/// Queued action; the sequence number is for diagnostics only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedAction {
    pub action: RequestedAction,
    pub sequence: u64,
}

impl fmt::Display for QueuedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.action, self.sequence)
    }
}

/// Progress of the in-flight sub-action's callback.
///
/// `Calling` means the initiator is still on the stack launching the action,
/// `Waiting` means the launch returned and the callback has not fired yet,
/// `Received` carries the state the callback resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackPhase {
    Calling,
    Waiting,
    Received(InternalState),
}

/// Result reported by a sub-action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubActionOutcome {
    Resolved(InternalState),
    StillPending,
}
