mod external;
mod polled;

pub use external::ExternalTriggerMonitor;
pub use polled::NotifyFileMonitor;

use crate::error::Result;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Change notification for a set of watched paths.
///
/// The first notification after `watch` is the baseline and lists the
/// watched paths that already exist as `created`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileChange {
    pub baseline: bool,
    pub created: BTreeSet<PathBuf>,
    pub modified: BTreeSet<PathBuf>,
    pub deleted: BTreeSet<PathBuf>,
}

impl FileChange {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

pub type ChangeListener = Arc<dyn Fn(FileChange) + Send + Sync>;

/// Watches file system paths on behalf of resolution actions
pub trait FileMonitor: Send + Sync {
    fn watch(&self, paths: Vec<PathBuf>, listener: ChangeListener) -> Result<MonitorHandle>;
}

/// Keeps a watch registered; dropping or cancelling it stops notifications
pub struct MonitorHandle {
    guard: Mutex<Option<Box<dyn Send>>>,
}

impl MonitorHandle {
    pub fn new<G: Send + 'static>(guard: G) -> Self {
        Self {
            guard: Mutex::new(Some(Box::new(guard))),
        }
    }

    pub fn cancel(&self) {
        self.guard.lock().take();
    }

    pub fn is_active(&self) -> bool {
        self.guard.lock().is_some()
    }
}

impl fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("active", &self.is_active())
            .finish()
    }
}
