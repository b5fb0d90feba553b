use crate::error::EventBusError;
use crate::state_machine::InternalState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Lifecycle notifications emitted by application state machines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// Internal state transition
    StateChanged {
        pid: String,
        from: InternalState,
        to: InternalState,
        timestamp: DateTime<Utc>,
    },
    /// Artifact location could not be found yet and is being watched
    ResolutionPending { pid: String, location: String },
    /// Artifact location could not be resolved
    ResolutionFailed { pid: String, error: String },
    /// Handler install has been called
    InstallCalled { pid: String, name: String },
    /// Install is still running after the slow start timeout
    SlowStart {
        pid: String,
        name: String,
        elapsed: Duration,
    },
    /// Application started
    Started { pid: String, name: String },
    /// Application failed to start
    StartFailed { pid: String, name: String, error: String },
    /// Handler uninstall has been called
    UninstallCalled { pid: String, name: String },
    /// Application stopped
    Stopped { pid: String, name: String },
    /// Application failed to stop
    StopFailed { pid: String, name: String, error: String },
    /// Application removed
    Removed { pid: String },
    /// The start-after chain of an application leads back to itself
    StartAfterCycle { pid: String, names: Vec<String> },
}

impl LifecycleEvent {
    pub fn state_changed(pid: &str, from: InternalState, to: InternalState) -> Self {
        LifecycleEvent::StateChanged {
            pid: pid.to_string(),
            from,
            to,
            timestamp: Utc::now(),
        }
    }

    /// Pid of the application the event concerns
    pub fn pid(&self) -> &str {
        match self {
            LifecycleEvent::StateChanged { pid, .. }
            | LifecycleEvent::ResolutionPending { pid, .. }
            | LifecycleEvent::ResolutionFailed { pid, .. }
            | LifecycleEvent::InstallCalled { pid, .. }
            | LifecycleEvent::SlowStart { pid, .. }
            | LifecycleEvent::Started { pid, .. }
            | LifecycleEvent::StartFailed { pid, .. }
            | LifecycleEvent::UninstallCalled { pid, .. }
            | LifecycleEvent::Stopped { pid, .. }
            | LifecycleEvent::StopFailed { pid, .. }
            | LifecycleEvent::Removed { pid }
            | LifecycleEvent::StartAfterCycle { pid, .. } => pid,
        }
    }

    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            LifecycleEvent::StateChanged { pid, from, to, .. } => {
                format!("{}: {} -> {}", pid, from, to)
            }
            LifecycleEvent::ResolutionPending { location, .. } => {
                format!("Waiting for application resource {}", location)
            }
            LifecycleEvent::ResolutionFailed { pid, error } => {
                format!("Resolution failed for {}: {}", pid, error)
            }
            LifecycleEvent::InstallCalled { name, .. } => {
                format!("Starting application {}", name)
            }
            LifecycleEvent::SlowStart { name, elapsed, .. } => {
                format!(
                    "Application {} has not started after {} seconds",
                    name,
                    elapsed.as_secs()
                )
            }
            LifecycleEvent::Started { name, .. } => format!("Application {} started", name),
            LifecycleEvent::StartFailed { name, error, .. } => {
                format!("Application {} failed to start: {}", name, error)
            }
            LifecycleEvent::UninstallCalled { name, .. } => {
                format!("Stopping application {}", name)
            }
            LifecycleEvent::Stopped { name, .. } => format!("Application {} stopped", name),
            LifecycleEvent::StopFailed { name, error, .. } => {
                format!("Application {} failed to stop: {}", name, error)
            }
            LifecycleEvent::Removed { pid } => format!("Application {} removed", pid),
            LifecycleEvent::StartAfterCycle { names, .. } => format!(
                "The start-after dependencies of applications {} form a cycle",
                names.join(", ")
            ),
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            LifecycleEvent::StateChanged { .. } => "state_changed",
            LifecycleEvent::ResolutionPending { .. } => "resolution_pending",
            LifecycleEvent::ResolutionFailed { .. } => "resolution_failed",
            LifecycleEvent::InstallCalled { .. } => "install_called",
            LifecycleEvent::SlowStart { .. } => "slow_start",
            LifecycleEvent::Started { .. } => "started",
            LifecycleEvent::StartFailed { .. } => "start_failed",
            LifecycleEvent::UninstallCalled { .. } => "uninstall_called",
            LifecycleEvent::Stopped { .. } => "stopped",
            LifecycleEvent::StopFailed { .. } => "stop_failed",
            LifecycleEvent::Removed { .. } => "removed",
            LifecycleEvent::StartAfterCycle { .. } => "start_after_cycle",
        }
    }
}

/// Broadcast bus carrying lifecycle notifications to operators and observers
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
    debug_logging: bool,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            debug_logging: false,
        }
    }

    /// Create a new event bus with debug logging enabled
    pub fn with_debug_logging(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            debug_logging: true,
        }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Subscribe with a filter
    pub fn subscribe_filtered<S: Into<String>>(&self, filter: EventFilter, name: S) -> EventReceiver {
        EventReceiver::new(self.sender.subscribe(), filter, name.into())
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of subscribers that received it; having none is not
    /// an error since the log line is the operator-facing record.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        match &event {
            LifecycleEvent::StartFailed { .. }
            | LifecycleEvent::StopFailed { .. }
            | LifecycleEvent::ResolutionFailed { .. }
            | LifecycleEvent::StartAfterCycle { .. } => {
                error!("{}", event.description());
            }
            LifecycleEvent::SlowStart { .. } => warn!("{}", event.description()),
            LifecycleEvent::Started { .. }
            | LifecycleEvent::Stopped { .. }
            | LifecycleEvent::Removed { .. }
            | LifecycleEvent::InstallCalled { .. } => info!("{}", event.description()),
            _ => {
                if self.debug_logging {
                    debug!("Event: {}", event.description());
                }
            }
        }

        self.sender.send(event).unwrap_or(0)
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            debug_logging: self.debug_logging,
        }
    }
}

/// Event filter for selective event handling
#[derive(Debug, Clone)]
pub enum EventFilter {
    /// Accept all events
    All,
    /// Accept only specific event types
    EventTypes(Vec<&'static str>),
    /// Accept events for specific applications
    Applications(Vec<String>),
    /// Custom filter function
    Custom(fn(&LifecycleEvent) -> bool),
}

impl EventFilter {
    /// Check if an event passes this filter
    pub fn matches(&self, event: &LifecycleEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::EventTypes(types) => types.contains(&event.event_type()),
            EventFilter::Applications(pids) => pids.iter().any(|pid| pid == event.pid()),
            EventFilter::Custom(filter_fn) => filter_fn(event),
        }
    }
}

/// Event receiver with filtering
pub struct EventReceiver {
    receiver: broadcast::Receiver<LifecycleEvent>,
    filter: EventFilter,
    name: String,
}

impl EventReceiver {
    pub fn new(
        receiver: broadcast::Receiver<LifecycleEvent>,
        filter: EventFilter,
        name: String,
    ) -> Self {
        Self {
            receiver,
            filter,
            name,
        }
    }

    /// Receive the next filtered event
    pub async fn recv(&mut self) -> Result<LifecycleEvent, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                    return Err(EventBusError::Lagged { missed: n });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed for receiver '{}'", self.name);
                    return Err(EventBusError::ChannelClosed);
                }
            }
        }
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<Option<LifecycleEvent>, EventBusError> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                    return Err(EventBusError::Lagged { missed: n });
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_event_bus_basic_operations() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        let delivered = event_bus.publish(LifecycleEvent::Started {
            pid: "p1".to_string(),
            name: "shop".to_string(),
        });
        assert_eq!(delivered, 1);

        match receiver.recv().await.unwrap() {
            LifecycleEvent::Started { name, .. } => assert_eq!(name, "shop"),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let event_bus = EventBus::new(4);
        assert_eq!(event_bus.subscriber_count(), 0);
        assert_eq!(
            event_bus.publish(LifecycleEvent::Removed {
                pid: "gone".to_string()
            }),
            0
        );
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let event_bus = EventBus::new(10);
        let mut receiver =
            event_bus.subscribe_filtered(EventFilter::Applications(vec!["b".to_string()]), "test");

        event_bus.publish(LifecycleEvent::Removed {
            pid: "a".to_string(),
        });
        event_bus.publish(LifecycleEvent::state_changed(
            "b",
            InternalState::Stopped,
            InternalState::Starting,
        ));

        let received = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.pid(), "b");
        assert_eq!(received.event_type(), "state_changed");
        assert!(receiver.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_event_properties() {
        let event = LifecycleEvent::SlowStart {
            pid: "p".to_string(),
            name: "reports".to_string(),
            elapsed: Duration::from_secs(45),
        };
        assert_eq!(event.event_type(), "slow_start");
        assert!(event.description().contains("45 seconds"));
    }
}
