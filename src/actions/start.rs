use super::{handler_result, ActionSink};
use crate::dependency::Outcome;
use crate::events::{EventBus, LifecycleEvent};
use crate::handler::InstallInfo;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Calls `install` on the handler and watches for a slow start
pub struct StartAction {
    info: Arc<InstallInfo>,
    events: EventBus,
    sink: ActionSink,
    watchdog: CancellationToken,
}

impl StartAction {
    pub fn new(info: Arc<InstallInfo>, events: EventBus, sink: ActionSink) -> Arc<Self> {
        Arc::new(Self {
            info,
            events,
            sink,
            watchdog: CancellationToken::new(),
        })
    }

    /// Launch the install. A handler that completes synchronously reports
    /// before this returns.
    pub fn execute(self: &Arc<Self>, scheduled: &Handle, slow_start_timeout: Duration) {
        self.events.publish(LifecycleEvent::InstallCalled {
            pid: self.info.pid().to_string(),
            name: self.info.name().to_string(),
        });
        self.arm_watchdog(scheduled, slow_start_timeout);

        let installed = self.info.handler.install(&self.info);
        let action = Arc::clone(self);
        installed.on_complete(move |outcome| action.complete(outcome));
    }

    pub fn cancel(&self) {
        self.watchdog.cancel();
        self.sink.cancel();
    }

    fn arm_watchdog(&self, scheduled: &Handle, timeout: Duration) {
        let token = self.watchdog.clone();
        let events = self.events.clone();
        let pid = self.info.pid().to_string();
        let name = self.info.name().to_string();
        let armed_at = Instant::now();

        scheduled.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    events.publish(LifecycleEvent::SlowStart {
                        pid,
                        name,
                        elapsed: armed_at.elapsed(),
                    });
                }
            }
        });
    }

    fn complete(&self, outcome: &Outcome<bool>) {
        self.watchdog.cancel();
        if !self.sink.is_live() {
            debug!("Install of {} completed after cancellation", self.info.pid());
            return;
        }

        let result = handler_result(outcome, "install", &self.info);
        match &result {
            Ok(()) => self.events.publish(LifecycleEvent::Started {
                pid: self.info.pid().to_string(),
                name: self.info.name().to_string(),
            }),
            Err(cause) => self.events.publish(LifecycleEvent::StartFailed {
                pid: self.info.pid().to_string(),
                name: self.info.name().to_string(),
                error: cause.to_string(),
            }),
        };
        self.sink.invoke(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::CancelableListener;
    use crate::test_support::{install_info, Reply, ScriptedHandler};
    use parking_lot::Mutex;

    fn recording_sink() -> (ActionSink, Arc<Mutex<Vec<Outcome<()>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        (
            CancelableListener::new(move |outcome| sink_seen.lock().push(outcome)),
            seen,
        )
    }

    #[tokio::test]
    async fn test_synchronous_install_reports_inline() {
        let handler = ScriptedHandler::new();
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let (sink, seen) = recording_sink();

        let action = StartAction::new(install_info("p1", handler.clone()), events, sink);
        action.execute(&Handle::current(), Duration::from_secs(30));

        assert!(matches!(seen.lock().as_slice(), [Ok(())]));
        assert_eq!(handler.install_count(), 1);
        assert_eq!(rx.recv().await.unwrap().event_type(), "install_called");
        assert_eq!(rx.recv().await.unwrap().event_type(), "started");
    }

    #[tokio::test]
    async fn test_rejected_install_fails_with_cause() {
        let handler = ScriptedHandler::new();
        handler.set_install(Reply::Reject);
        let (sink, seen) = recording_sink();

        let action = StartAction::new(install_info("p1", handler), EventBus::new(16), sink);
        action.execute(&Handle::current(), Duration::from_secs(30));

        let seen = seen.lock();
        match seen.as_slice() {
            [Err(cause)] => assert!(cause.to_string().contains("install")),
            other => panic!("Unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_start_warning_then_cancel() {
        let handler = ScriptedHandler::new();
        handler.set_install(Reply::Manual);
        let events = EventBus::new(16);
        let mut rx = events.subscribe_filtered(
            crate::events::EventFilter::EventTypes(vec!["slow_start"]),
            "test",
        );
        let (sink, seen) = recording_sink();

        let action = StartAction::new(install_info("p1", handler.clone()), events, sink);
        action.execute(&Handle::current(), Duration::from_millis(20));
        assert!(seen.lock().is_empty());

        let warning = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(warning.pid(), "p1");

        action.cancel();
        for pending in handler.take_pending_installs() {
            pending.resolve(true);
        }
        assert!(seen.lock().is_empty());
    }
}
