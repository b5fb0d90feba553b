//! Attempt-or-queue protocol and the shared driver.
//!
//! The `executing` flag in [`Control`] is the driver token: whoever sets it
//! runs state entries until the machine goes idle or parks on a start/stop
//! callback, then hands it back in `run_steps`. Sub-action callbacks never
//! enter states themselves; they record their outcome in the callback slot
//! and either leave it for the thread that launched them or schedule the
//! driver.

use super::machine::{ActiveCallback, Control, InFlight, MachineInner, Step};
use super::types::{CallbackPhase, QueuedAction, RequestedAction, SubActionOutcome};
use crate::config::ApplicationConfig;
use std::sync::Arc;
use tracing::{debug, warn};

enum Attempt {
    RunNow,
    Schedule,
    Queued,
}

enum Work {
    Enter(super::InternalState),
    Perform(QueuedAction),
}

impl MachineInner {
    /// Run `action` now if the machine is idle, otherwise queue it
    pub(super) fn attempt(
        self: &Arc<Self>,
        action: RequestedAction,
        config: Option<Arc<ApplicationConfig>>,
    ) {
        let decision = {
            let mut control = self.control.lock();
            if let Some(config) = config {
                control.pending_config = Some(config);
            }
            if action == RequestedAction::Remove {
                control.remove_requested = true;
            }

            if control.interruptible
                && !control.executing
                && !control.driver_scheduled
                && control.queue.is_empty()
            {
                control.executing = true;
                control.interruptible = false;
                Attempt::RunNow
            } else {
                if action == RequestedAction::Configure
                    && control
                        .queue
                        .iter()
                        .any(|queued| queued.action == RequestedAction::Configure)
                {
                    debug!("{}: CONFIGURE already queued", self.pid);
                } else {
                    let queued = QueuedAction {
                        action,
                        sequence: self.sequence.next(),
                    };
                    debug!("{}: queued {}", self.pid, queued);
                    control.queue.push_back(queued);
                }
                if Self::claim_driver(&mut control) {
                    Attempt::Schedule
                } else {
                    Attempt::Queued
                }
            }
        };

        match decision {
            Attempt::RunNow => {
                debug!("{}: performing {} directly", self.pid, action);
                let step = self.perform_action(action);
                self.run_steps(step);
            }
            Attempt::Schedule => self.schedule_driver(),
            Attempt::Queued => {}
        }
    }

    /// Mark the driver scheduled if there is work it can do right now
    fn claim_driver(control: &mut Control) -> bool {
        if control.executing || control.driver_scheduled {
            return false;
        }
        let received = matches!(
            control.callback,
            Some(ActiveCallback {
                phase: CallbackPhase::Received(_),
                ..
            })
        );
        if received || (control.interruptible && !control.queue.is_empty()) {
            control.driver_scheduled = true;
            true
        } else {
            false
        }
    }

    pub(super) fn schedule_driver(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.executors.general.spawn(async move {
            inner.run_driver();
        });
    }

    fn run_driver(self: &Arc<Self>) {
        loop {
            let work = {
                let mut control = self.control.lock();
                if control.executing {
                    control.driver_scheduled = false;
                    return;
                }
                let callback = control.callback;
                match callback {
                    Some(ActiveCallback {
                        phase: CallbackPhase::Received(next),
                        ..
                    }) => {
                        control.callback = None;
                        control.executing = true;
                        control.interruptible = false;
                        Work::Enter(next)
                    }
                    _ if !control.interruptible => {
                        control.driver_scheduled = false;
                        return;
                    }
                    _ => match control.queue.pop_front() {
                        Some(queued) => {
                            control.executing = true;
                            control.interruptible = false;
                            Work::Perform(queued)
                        }
                        None => {
                            control.driver_scheduled = false;
                            drop(control);
                            self.drained.notify_waiters();
                            return;
                        }
                    },
                }
            };

            let step = match work {
                Work::Enter(next) => Step::Enter(next),
                Work::Perform(queued) => {
                    debug!("{}: performing {}", self.pid, queued);
                    self.perform_action(queued.action)
                }
            };
            self.run_steps(step);
        }
    }

    /// Enter states until the machine settles, then hand back the token
    fn run_steps(self: &Arc<Self>, mut step: Step) {
        let parked = loop {
            match step {
                Step::Enter(next) => step = self.enter(next),
                Step::Idle => break false,
                Step::Parked => break true,
            }
        };

        let (schedule, drained) = {
            let mut control = self.control.lock();
            assert!(
                control.executing,
                "{}: driver token released twice",
                self.pid
            );
            assert!(
                !control.interruptible,
                "{}: interruptible while an entry was executing",
                self.pid
            );
            control.executing = false;
            control.interruptible = !parked;
            let schedule = Self::claim_driver(&mut control);
            let drained = !schedule
                && !control.driver_scheduled
                && control.interruptible
                && control.queue.is_empty();
            (schedule, drained)
        };

        if schedule {
            self.schedule_driver();
        }
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Open a callback slot for a sub-action about to be launched
    pub(super) fn begin_callback(&self) -> u64 {
        let mut control = self.control.lock();
        assert!(
            control.executing,
            "{}: sub-action launched without the driver token",
            self.pid
        );
        control.generation += 1;
        if let Some(stale) = control.callback {
            debug!(
                "{}: dropping stale callback #{}",
                self.pid, stale.generation
            );
        }
        control.callback = Some(ActiveCallback {
            generation: control.generation,
            phase: CallbackPhase::Calling,
        });
        control.generation
    }

    /// Called by the launching thread once the sub-action has been started
    pub(super) fn after_launch(&self, generation: u64, parked: bool) -> Step {
        let mut control = self.control.lock();
        let phase = match control.callback {
            Some(callback) if callback.generation == generation => callback.phase,
            _ => panic!(
                "{}: callback slot #{} lost while launching",
                self.pid, generation
            ),
        };
        match phase {
            CallbackPhase::Received(next) => {
                control.callback = None;
                Step::Enter(next)
            }
            CallbackPhase::Calling => {
                control.callback = Some(ActiveCallback {
                    generation,
                    phase: CallbackPhase::Waiting,
                });
                if parked {
                    Step::Parked
                } else {
                    Step::Idle
                }
            }
            CallbackPhase::Waiting => panic!(
                "{}: callback #{} registered twice",
                self.pid, generation
            ),
        }
    }

    /// Deliver a sub-action outcome. `stash` runs under the control lock
    /// only when `generation` is still the live callback.
    pub(super) fn complete_callback<F>(
        self: &Arc<Self>,
        generation: u64,
        outcome: SubActionOutcome,
        stash: F,
    ) where
        F: FnOnce(&MachineInner),
    {
        let next = match outcome {
            SubActionOutcome::Resolved(next) => next,
            SubActionOutcome::StillPending => {
                debug!("{}: sub-action #{} still pending", self.pid, generation);
                return;
            }
        };

        let schedule = {
            let mut control = self.control.lock();
            let current = control.callback;
            match current {
                Some(callback) if callback.generation == generation => match callback.phase {
                    CallbackPhase::Received(_) => {
                        warn!(
                            "{}: duplicate completion for callback #{}",
                            self.pid, generation
                        );
                        return;
                    }
                    CallbackPhase::Calling | CallbackPhase::Waiting => {
                        control.callback = Some(ActiveCallback {
                            generation,
                            phase: CallbackPhase::Received(next),
                        });
                    }
                },
                _ => {
                    debug!("{}: ignoring stale callback #{}", self.pid, generation);
                    return;
                }
            }
            stash(&**self);
            Self::claim_driver(&mut control)
        };

        if schedule {
            self.schedule_driver();
        }
    }

    /// Drop a wait the machine may abandon: gates or resolution.
    /// Start and stop callbacks are left to complete.
    pub(super) fn cancel_interruptible_wait(&self) {
        let abandoned = {
            let mut control = self.control.lock();
            if control.executing || !control.interruptible || control.callback.is_none() {
                return;
            }
            control.callback = None;
            std::mem::replace(&mut *self.in_flight.lock(), InFlight::Nothing)
        };
        debug!("{}: cancelled pending wait", self.pid);
        abandoned.cancel();
    }

    /// Clear the callback slot while holding the driver token
    pub(super) fn clear_callback(&self) {
        self.control.lock().callback = None;
        self.cancel_in_flight();
    }

    pub(super) fn set_in_flight(&self, action: InFlight) {
        let previous = std::mem::replace(&mut *self.in_flight.lock(), action);
        previous.cancel();
    }

    pub(super) fn cancel_in_flight(&self) {
        self.set_in_flight(InFlight::Nothing);
    }

    pub(super) fn restart(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.executors.general.spawn(async move {
            inner.wait_for_drain().await;
            inner.attempt(RequestedAction::Restart, None);
        });
    }

    fn is_drained(&self) -> bool {
        let control = self.control.lock();
        control.queue.is_empty() && !control.executing && !control.driver_scheduled
    }

    /// Wait, bounded, until no queued work remains
    async fn wait_for_drain(&self) {
        let limit = self.settings.restart_drain_timeout;
        let drained = async {
            loop {
                let notified = self.drained.notified();
                if self.is_drained() {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(limit, drained).await.is_err() {
            warn!(
                "Queued actions for {} did not drain within {:?}, restarting anyway",
                self.pid, limit
            );
        }
    }
}
