use super::machine::{InFlight, MachineInner, Milestone, Step};
use super::types::{InternalState, RequestedAction, SubActionOutcome};
use crate::actions::{StartAction, StopAction};
use crate::dependency::{CancelableListener, GateWaiter, Outcome};
use crate::error::AppManagerError;
use crate::events::LifecycleEvent;
use crate::handler::{ApplicationState, InstallInfo};
use crate::resolve::{ResolutionEvent, ResourceAction};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Marks a state entry in progress; a second concurrent entry is a bug
struct EntryGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> EntryGuard<'a> {
    fn acquire(flag: &'a AtomicBool, pid: &str) -> Self {
        if flag.swap(true, Ordering::SeqCst) {
            panic!("{}: re-entrant state entry", pid);
        }
        Self { flag }
    }
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl MachineInner {
    /// Apply a requested action to the current state
    pub(super) fn perform_action(self: &Arc<Self>, action: RequestedAction) -> Step {
        use InternalState::*;

        let state = self.state();
        match state {
            Starting | Stopping => {
                debug!("{}: {} deferred while {}", self.pid, action, state);
                return Step::Parked;
            }
            Removed => {
                debug!("{}: {} ignored, application removed", self.pid, action);
                return Step::Idle;
            }
            _ => {}
        }

        // anything still pending from STOPPED is superseded
        self.clear_callback();

        match (state, action) {
            (Started, RequestedAction::Start) => Step::Enter(Started),
            (Started, _) => Step::Enter(Stopping),
            (_, RequestedAction::Remove) => Step::Enter(Removed),
            _ => Step::Enter(Stopped),
        }
    }

    pub(super) fn enter(self: &Arc<Self>, next: InternalState) -> Step {
        let _entry = EntryGuard::acquire(&self.in_entry, &self.pid);
        let from = self.set_state(next);

        match next {
            InternalState::Initial => unreachable!("INITIAL is never re-entered"),
            InternalState::Stopped => self.enter_stopped(from),
            InternalState::Starting => self.enter_starting(),
            InternalState::Started => self.enter_started(),
            InternalState::Stopping => self.enter_stopping(),
            InternalState::Failed => self.enter_failed(),
            InternalState::Removed => self.enter_removed(),
        }
    }

    fn set_state(&self, next: InternalState) -> InternalState {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            assert!(
                from.can_transition_to(next),
                "{}: illegal transition {} -> {}",
                self.pid,
                from,
                next
            );
            *state = next;
            from
        };
        debug!("{}: {} -> {}", self.pid, from, next);
        self.events
            .publish(LifecycleEvent::state_changed(&self.pid, from, next));
        from
    }

    fn switch_external(&self, state: ApplicationState) {
        let config = self.runtime.lock().config.clone();
        self.helper.switch_application_state(config.as_deref(), state);
    }

    /// Forget the installed application and deregister it
    fn release_install(&self) {
        let released = self.runtime.lock().install_info.take();
        if let Some(info) = released {
            self.monitor.remove_application(&info);
        }
    }

    fn enter_stopped(self: &Arc<Self>, from: InternalState) -> Step {
        if from == InternalState::Stopping {
            self.release_install();
        }
        self.switch_external(ApplicationState::Stopped);

        if from == InternalState::Stopping {
            let flushed = {
                let mut control = self.control.lock();
                control.queue.drain(..).count()
            };
            if flushed > 0 {
                debug!(
                    "{}: discarded {} action(s) queued while stopping",
                    self.pid, flushed
                );
            }
        }
        self.resolve_milestone(Milestone::Stopped);

        if self.control.lock().remove_requested {
            return Step::Enter(InternalState::Removed);
        }

        let pending = self.gates.lock().readiness_pending();
        if !pending.is_empty() {
            debug!("{}: waiting for {} start gate(s)", self.pid, pending.len());
            let generation = self.begin_callback();
            let weak = Arc::downgrade(self);
            let waiter = GateWaiter::wait_all(&pending, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.complete_callback(
                        generation,
                        SubActionOutcome::Resolved(InternalState::Stopped),
                        |_| {},
                    );
                }
            });
            self.set_in_flight(InFlight::Gates(waiter));
            return self.after_launch(generation, false);
        }

        let config = {
            let pending_config = self.control.lock().pending_config.take();
            let mut runtime = self.runtime.lock();
            if let Some(config) = pending_config {
                runtime.config = Some(config);
            }
            runtime.config.clone()
        };
        let Some(config) = config else {
            debug!("{}: stopped without a configuration", self.pid);
            return Step::Idle;
        };

        if let Err(e) = config.validate() {
            self.runtime.lock().failure = Some(e.into_cause());
            return Step::Enter(InternalState::Failed);
        }

        let handler = self.runtime.lock().handler.clone();
        if handler.is_none() {
            self.arm_handler_gate();
            if self.helper.app_type_supported() {
                info!(
                    "{} is waiting for a handler for type '{}'",
                    config.label(),
                    config.app_type()
                );
            } else {
                let cause = AppManagerError::UnsupportedType {
                    app_type: config.app_type().to_string(),
                }
                .into_cause();
                warn!("{} cannot start: {}", config.label(), cause);
                self.fail_milestone(Milestone::Starting, &cause);
                self.resolve_milestone(Milestone::InstallCalled);
            }
            return Step::Idle;
        }

        let location = config.location.clone().unwrap_or_default();
        let generation = self.begin_callback();
        let weak = Arc::downgrade(self);
        let sink = CancelableListener::new(move |event: ResolutionEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_resolution(generation, event);
            }
        });
        let action = ResourceAction::new(
            self.pid.clone(),
            location,
            Arc::clone(&self.resolver),
            self.container_builder(),
            sink,
        );
        self.set_in_flight(InFlight::Resolve(Arc::clone(&action)));
        action.execute();
        self.after_launch(generation, false)
    }

    fn on_resolution(self: &Arc<Self>, generation: u64, event: ResolutionEvent) {
        match event {
            ResolutionEvent::Pending => {
                self.complete_callback(generation, SubActionOutcome::StillPending, |_| {})
            }
            ResolutionEvent::Resolved {
                container,
                resource,
            } => self.complete_callback(
                generation,
                SubActionOutcome::Resolved(InternalState::Starting),
                move |inner| {
                    inner.runtime.lock().resolved = Some((container, resource));
                },
            ),
            ResolutionEvent::Failed(cause) => self.complete_callback(
                generation,
                SubActionOutcome::Resolved(InternalState::Failed),
                move |inner| {
                    inner.runtime.lock().failure = Some(cause);
                },
            ),
        }
    }

    fn on_action_result(self: &Arc<Self>, generation: u64, success: InternalState, outcome: Outcome<()>) {
        match outcome {
            Ok(()) => {
                self.complete_callback(generation, SubActionOutcome::Resolved(success), |_| {})
            }
            Err(cause) => self.complete_callback(
                generation,
                SubActionOutcome::Resolved(InternalState::Failed),
                move |inner| {
                    inner.runtime.lock().failure = Some(cause);
                },
            ),
        }
    }

    fn enter_starting(self: &Arc<Self>) -> Step {
        self.switch_external(ApplicationState::Starting);

        let (config, handler, resolved) = {
            let mut runtime = self.runtime.lock();
            (
                runtime.config.clone(),
                runtime.handler.clone(),
                runtime.resolved.take(),
            )
        };
        let (Some(config), Some((container, resource))) = (config, resolved) else {
            panic!("{}: entered STARTING without a resolved configuration", self.pid);
        };
        let Some(handler) = handler else {
            let cause =
                AppManagerError::handler("install", config.label(), "no handler registered");
            self.runtime.lock().failure = Some(cause.into_cause());
            return Step::Enter(InternalState::Failed);
        };

        let info = Arc::new(InstallInfo {
            config,
            container,
            resource,
            handler: Arc::clone(&handler),
        });
        self.runtime.lock().install_info = Some(Arc::clone(&info));
        let monitoring = handler.set_up_application_monitoring(&info);
        self.monitor.add_application(&info, monitoring.as_ref());

        let generation = self.begin_callback();
        let weak = Arc::downgrade(self);
        let sink = CancelableListener::new(move |outcome: Outcome<()>| {
            if let Some(inner) = weak.upgrade() {
                inner.on_action_result(generation, InternalState::Started, outcome);
            }
        });
        let action = StartAction::new(info, self.events.clone(), sink);
        self.set_in_flight(InFlight::Start(Arc::clone(&action)));
        action.execute(&self.executors.scheduled, self.settings.slow_start_timeout);

        self.resolve_milestone(Milestone::Starting);
        self.resolve_milestone(Milestone::InstallCalled);
        self.after_launch(generation, true)
    }

    fn enter_started(&self) -> Step {
        self.switch_external(ApplicationState::Started);
        self.resolve_milestone(Milestone::Started);
        self.helper.notify_app_started(&self.pid);
        Step::Idle
    }

    fn enter_stopping(self: &Arc<Self>) -> Step {
        let info = self.runtime.lock().install_info.clone();
        let Some(info) = info else {
            panic!("{}: entered STOPPING without an installed application", self.pid);
        };

        let generation = self.begin_callback();
        let weak = Arc::downgrade(self);
        let sink = CancelableListener::new(move |outcome: Outcome<()>| {
            if let Some(inner) = weak.upgrade() {
                inner.on_action_result(generation, InternalState::Stopped, outcome);
            }
        });
        let action = StopAction::new(info, self.events.clone(), sink);
        self.set_in_flight(InFlight::Stop(Arc::clone(&action)));
        action.execute();

        self.switch_external(ApplicationState::Stopping);
        self.after_launch(generation, true)
    }

    fn enter_failed(&self) -> Step {
        let cause = self.runtime.lock().failure.take().unwrap_or_else(|| {
            AppManagerError::system(format!("application {} failed", self.pid)).into_cause()
        });
        self.release_install();
        self.runtime.lock().resolved = None;
        warn!("Application {} failed: {}", self.pid, cause);

        self.switch_external(ApplicationState::Installed);
        self.fail_milestone(Milestone::Starting, &cause);
        self.fail_milestone(Milestone::Started, &cause);
        self.fail_milestone(Milestone::Stopped, &cause);
        self.resolve_milestone(Milestone::InstallCalled);
        self.helper.notify_app_failed(&self.pid);

        if self.control.lock().remove_requested {
            return Step::Enter(InternalState::Removed);
        }
        Step::Idle
    }

    fn enter_removed(&self) -> Step {
        self.release_install();
        self.switch_external(ApplicationState::Stopped);
        self.events.publish(LifecycleEvent::Removed {
            pid: self.pid.clone(),
        });

        self.helper.notify_app_removed(&self.pid);
        self.resolve_milestone(Milestone::Removed);
        let cause = AppManagerError::AlreadyRemoved {
            pid: self.pid.clone(),
        }
        .into_cause();
        self.fail_milestone(Milestone::Starting, &cause);
        self.resolve_milestone(Milestone::Started);
        self.resolve_milestone(Milestone::Stopped);
        self.resolve_milestone(Milestone::InstallCalled);

        let flushed = self.control.lock().queue.drain(..).count();
        if flushed > 0 {
            debug!("{}: discarded {} action(s) after removal", self.pid, flushed);
        }
        self.clear_callback();
        Step::Idle
    }
}
