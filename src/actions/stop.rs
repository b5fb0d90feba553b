use super::{handler_result, ActionSink};
use crate::dependency::Outcome;
use crate::events::{EventBus, LifecycleEvent};
use crate::handler::InstallInfo;
use std::sync::Arc;
use tracing::debug;

/// Calls `uninstall` on the handler
pub struct StopAction {
    info: Arc<InstallInfo>,
    events: EventBus,
    sink: ActionSink,
}

impl StopAction {
    pub fn new(info: Arc<InstallInfo>, events: EventBus, sink: ActionSink) -> Arc<Self> {
        Arc::new(Self { info, events, sink })
    }

    pub fn execute(self: &Arc<Self>) {
        self.events.publish(LifecycleEvent::UninstallCalled {
            pid: self.info.pid().to_string(),
            name: self.info.name().to_string(),
        });

        let uninstalled = self.info.handler.uninstall(&self.info);
        let action = Arc::clone(self);
        uninstalled.on_complete(move |outcome| action.complete(outcome));
    }

    pub fn cancel(&self) {
        self.sink.cancel();
    }

    fn complete(&self, outcome: &Outcome<bool>) {
        if !self.sink.is_live() {
            debug!("Uninstall of {} completed after cancellation", self.info.pid());
            return;
        }

        let result = handler_result(outcome, "uninstall", &self.info);
        match &result {
            Ok(()) => self.events.publish(LifecycleEvent::Stopped {
                pid: self.info.pid().to_string(),
                name: self.info.name().to_string(),
            }),
            Err(cause) => self.events.publish(LifecycleEvent::StopFailed {
                pid: self.info.pid().to_string(),
                name: self.info.name().to_string(),
                error: cause.to_string(),
            }),
        };
        self.sink.invoke(result);
    }
}
