use super::{ChangeListener, FileChange, FileMonitor, MonitorHandle};
use crate::error::{AppManagerError, Result};
use notify_debouncer_full::{
    new_debouncer,
    notify::{EventKind, RecursiveMode, Watcher},
    DebounceEventResult,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Polled file monitor backed by the platform watcher.
///
/// The parent directory of every watched path is registered non-recursively
/// and raw events are debounced over the configured interval.
pub struct NotifyFileMonitor {
    interval: Duration,
}

impl NotifyFileMonitor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

/// Canonical parent joined with the file name, so relative and absolute
/// spellings of one location compare equal
fn normalize(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|parent| parent.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

impl FileMonitor for NotifyFileMonitor {
    fn watch(&self, paths: Vec<PathBuf>, listener: ChangeListener) -> Result<MonitorHandle> {
        let parents: BTreeSet<PathBuf> = paths
            .iter()
            .filter_map(|path| path.parent().map(Path::to_path_buf))
            .filter(|parent| parent.is_dir())
            .collect();
        if parents.is_empty() {
            return Err(AppManagerError::Monitor(format!(
                "none of the directories for {:?} exist",
                paths
            )));
        }

        let targets: Arc<BTreeSet<PathBuf>> = Arc::new(paths.iter().map(|p| normalize(p)).collect());
        let event_targets = Arc::clone(&targets);
        let event_listener = Arc::clone(&listener);

        let mut debouncer = new_debouncer(
            self.interval,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let mut change = FileChange::default();
                    for event in events {
                        for path in &event.paths {
                            let path = normalize(path);
                            if !event_targets.contains(&path) {
                                continue;
                            }
                            match event.kind {
                                EventKind::Create(_) => {
                                    change.created.insert(path);
                                }
                                EventKind::Modify(_) => {
                                    change.modified.insert(path);
                                }
                                EventKind::Remove(_) => {
                                    change.deleted.insert(path);
                                }
                                _ => {}
                            }
                        }
                    }
                    if !change.is_empty() {
                        debug!("File monitor change: {:?}", change);
                        event_listener(change);
                    }
                }
                Err(errors) => {
                    for error in errors {
                        warn!("File monitor error: {}", error);
                    }
                }
            },
        )
        .map_err(|e| AppManagerError::Monitor(e.to_string()))?;

        for dir in &parents {
            debouncer
                .watcher()
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|e| AppManagerError::Monitor(format!("{}: {}", dir.display(), e)))?;
        }
        debug!("Watching {} director(ies) for {:?}", parents.len(), paths);

        let baseline = FileChange {
            baseline: true,
            created: targets.iter().filter(|p| p.exists()).cloned().collect(),
            ..FileChange::default()
        };
        listener(baseline);

        Ok(MonitorHandle::new(debouncer))
    }
}
