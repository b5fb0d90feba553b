use super::{ChangeListener, FileChange, FileMonitor, MonitorHandle};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use tracing::debug;

type Snapshot = BTreeMap<PathBuf, Option<SystemTime>>;

struct Registration {
    id: u64,
    paths: Vec<PathBuf>,
    known: Snapshot,
    listener: ChangeListener,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    registrations: Vec<Registration>,
}

/// Monitor that only scans when told to.
///
/// Used when change detection is driven by an outside trigger (an
/// administrative "refresh" request) instead of a polling interval.
#[derive(Default)]
pub struct ExternalTriggerMonitor {
    registry: Arc<Mutex<Registry>>,
}

struct Deregister {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().registrations.retain(|r| r.id != self.id);
        }
    }
}

fn snapshot(paths: &[PathBuf]) -> Snapshot {
    paths
        .iter()
        .filter_map(|path| {
            let metadata = std::fs::metadata(path).ok()?;
            Some((path.clone(), metadata.modified().ok()))
        })
        .collect()
}

fn diff(before: &Snapshot, after: &Snapshot) -> FileChange {
    let mut change = FileChange::default();
    for (path, modified) in after {
        match before.get(path) {
            None => {
                change.created.insert(path.clone());
            }
            Some(previous) if previous != modified => {
                change.modified.insert(path.clone());
            }
            Some(_) => {}
        }
    }
    for path in before.keys() {
        if !after.contains_key(path) {
            change.deleted.insert(path.clone());
        }
    }
    change
}

impl ExternalTriggerMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registrations(&self) -> usize {
        self.registry.lock().registrations.len()
    }

    /// Rescan every registration and deliver changes.
    /// Returns the number of listeners notified.
    pub fn trigger(&self) -> usize {
        let pending: Vec<(ChangeListener, FileChange)> = {
            let mut registry = self.registry.lock();
            registry
                .registrations
                .iter_mut()
                .filter_map(|registration| {
                    let current = snapshot(&registration.paths);
                    let change = diff(&registration.known, &current);
                    registration.known = current;
                    (!change.is_empty()).then(|| (Arc::clone(&registration.listener), change))
                })
                .collect()
        };

        debug!("External scan found {} change set(s)", pending.len());
        let notified = pending.len();
        for (listener, change) in pending {
            listener(change);
        }
        notified
    }
}

impl FileMonitor for ExternalTriggerMonitor {
    fn watch(&self, paths: Vec<PathBuf>, listener: ChangeListener) -> Result<MonitorHandle> {
        let known = snapshot(&paths);
        let baseline = FileChange {
            baseline: true,
            created: known.keys().cloned().collect(),
            ..FileChange::default()
        };

        let id = {
            let mut registry = self.registry.lock();
            registry.next_id += 1;
            let id = registry.next_id;
            registry.registrations.push(Registration {
                id,
                paths,
                known,
                listener: Arc::clone(&listener),
            });
            id
        };

        listener(baseline);

        Ok(MonitorHandle::new(Deregister {
            id,
            registry: Arc::downgrade(&self.registry),
        }))
    }
}
