use crate::error::Cause;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Result carried by a completed dependency
pub type Outcome<T> = std::result::Result<T, Cause>;

/// Dependency used for application milestones and start gates
pub type ApplicationDependency = Dependency<bool>;

type Listener<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

/// Identifies a listener registered on a pending dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum Slot<T> {
    Pending(Vec<(ListenerId, Listener<T>)>),
    Done(Outcome<T>),
}

struct Shared<T> {
    description: String,
    slot: Mutex<Slot<T>>,
    done: Notify,
    next_listener: AtomicU64,
}

/// Single-assignment result cell with completion listeners.
///
/// Cloning yields another handle onto the same cell. The first `resolve` or
/// `fail` wins; later attempts report `false` and leave the outcome untouched.
/// Listeners registered after completion run immediately on the registering
/// thread, listeners registered before run on the completing thread once the
/// cell lock has been released.
pub struct Dependency<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Dependency<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Dependency<T> {
    /// Create a pending dependency
    pub fn new<S: Into<String>>(description: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                description: description.into(),
                slot: Mutex::new(Slot::Pending(Vec::new())),
                done: Notify::new(),
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    /// Create a dependency that is already resolved
    pub fn resolved<S: Into<String>>(description: S, value: T) -> Self {
        let dependency = Self::new(description);
        dependency.resolve(value);
        dependency
    }

    /// Create a dependency that has already failed
    pub fn failed<S: Into<String>>(description: S, cause: Cause) -> Self {
        let dependency = Self::new(description);
        dependency.fail(cause);
        dependency
    }

    pub fn description(&self) -> &str {
        &self.shared.description
    }

    /// Complete successfully. Returns `false` if already complete.
    pub fn resolve(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Complete with a failure. Returns `false` if already complete.
    pub fn fail(&self, cause: Cause) -> bool {
        self.complete(Err(cause))
    }

    fn complete(&self, outcome: Outcome<T>) -> bool {
        let listeners = {
            let mut slot = self.shared.slot.lock();
            match &mut *slot {
                Slot::Done(_) => return false,
                Slot::Pending(listeners) => {
                    let listeners = std::mem::take(listeners);
                    *slot = Slot::Done(outcome.clone());
                    listeners
                }
            }
        };

        self.shared.done.notify_waiters();
        for (_, listener) in listeners {
            listener(&outcome);
        }
        true
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.shared.slot.lock(), Slot::Done(_))
    }

    pub fn is_pending(&self) -> bool {
        !self.is_done()
    }

    /// Outcome if complete
    pub fn outcome(&self) -> Option<Outcome<T>> {
        match &*self.shared.slot.lock() {
            Slot::Done(outcome) => Some(outcome.clone()),
            Slot::Pending(_) => None,
        }
    }

    /// Register a completion listener
    pub fn on_complete<F>(&self, listener: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        self.subscribe(listener);
    }

    /// Register a completion listener that can later be withdrawn.
    ///
    /// Returns `None` when the dependency was already complete, in which case
    /// the listener has run before this returns.
    pub fn subscribe<F>(&self, listener: F) -> Option<ListenerId>
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let outcome = {
            let mut slot = self.shared.slot.lock();
            match &mut *slot {
                Slot::Pending(listeners) => {
                    let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
                    listeners.push((id, Box::new(listener)));
                    return Some(id);
                }
                Slot::Done(outcome) => outcome.clone(),
            }
        };
        listener(&outcome);
        None
    }

    /// Withdraw a pending listener. Returns `false` if it already ran or
    /// was withdrawn before.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut slot = self.shared.slot.lock();
        match &mut *slot {
            Slot::Pending(listeners) => {
                let before = listeners.len();
                listeners.retain(|(registered, _)| *registered != id);
                listeners.len() != before
            }
            Slot::Done(_) => false,
        }
    }

    /// Number of listeners still waiting for completion
    pub fn listener_count(&self) -> usize {
        match &*self.shared.slot.lock() {
            Slot::Pending(listeners) => listeners.len(),
            Slot::Done(_) => 0,
        }
    }

    /// Wait asynchronously for the outcome
    pub async fn wait(&self) -> Outcome<T> {
        loop {
            let notified = self.shared.done.notified();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Wait for the outcome, giving up after `limit`
    pub async fn wait_timeout(&self, limit: Duration) -> Option<Outcome<T>> {
        tokio::time::timeout(limit, self.wait()).await.ok()
    }

    /// True when both handles refer to the same cell
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T> fmt::Debug for Dependency<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.slot.lock() {
            Slot::Pending(listeners) => format!("pending ({} listeners)", listeners.len()),
            Slot::Done(Ok(_)) => "resolved".to_string(),
            Slot::Done(Err(cause)) => format!("failed: {}", cause),
        };
        f.debug_struct("Dependency")
            .field("description", &self.shared.description)
            .field("state", &state)
            .finish()
    }
}

type Callback<A> = Arc<dyn Fn(A) + Send + Sync>;

/// Listener wrapper that can be disarmed.
///
/// `cancel` drops the inner callback; any invocation after that is a no-op.
pub struct CancelableListener<A> {
    inner: Arc<Mutex<Option<Callback<A>>>>,
}

impl<A> Clone for CancelableListener<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> CancelableListener<A> {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Arc::new(callback)))),
        }
    }

    /// Disarm the listener. Returns `true` if it was still live.
    pub fn cancel(&self) -> bool {
        self.inner.lock().take().is_some()
    }

    pub fn is_live(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Invoke the callback if still live. The lock is not held during the call.
    pub fn invoke(&self, arg: A) -> bool {
        let callback = self.inner.lock().clone();
        match callback {
            Some(callback) => {
                callback(arg);
                true
            }
            None => false,
        }
    }
}

type Detach = Box<dyn Fn() + Send + Sync>;

/// Fires once when every dependency in a set has completed, unless cancelled.
///
/// Cancelling also withdraws the listeners from dependencies that are still
/// pending, so gates that never complete do not accumulate dead waiters.
pub struct GateWaiter {
    listener: CancelableListener<()>,
    waiting_on: usize,
    detach: Mutex<Vec<Detach>>,
}

impl GateWaiter {
    pub fn wait_all<T, F>(dependencies: &[Dependency<T>], on_ready: F) -> Self
    where
        T: Clone + Send + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        let listener = CancelableListener::new(move |()| on_ready());
        let waiter = Self {
            listener: listener.clone(),
            waiting_on: dependencies.len(),
            detach: Mutex::new(Vec::new()),
        };

        if dependencies.is_empty() {
            listener.invoke(());
            return waiter;
        }

        let remaining = Arc::new(AtomicUsize::new(dependencies.len()));
        for dependency in dependencies {
            let remaining = Arc::clone(&remaining);
            let listener = listener.clone();
            let registered = dependency.subscribe(move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    listener.invoke(());
                }
            });
            if let Some(id) = registered {
                let dependency = dependency.clone();
                waiter.detach.lock().push(Box::new(move || {
                    dependency.unsubscribe(id);
                }));
            }
        }
        waiter
    }

    pub fn cancel(&self) -> bool {
        let was_live = self.listener.cancel();
        let detach = std::mem::take(&mut *self.detach.lock());
        for withdraw in detach {
            withdraw();
        }
        was_live
    }

    pub fn waiting_on(&self) -> usize {
        self.waiting_on
    }
}

impl fmt::Debug for GateWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateWaiter")
            .field("waiting_on", &self.waiting_on)
            .field("live", &self.listener.is_live())
            .finish()
    }
}
