//! Resolution of a configured application location to a container.
//!
//! A location is either a remote `http`/`https` URL, downloaded into the
//! application's download cache, or a local path searched in the server and
//! shared application directories. A local location that does not exist yet
//! can be watched so that its later appearance completes the resolution.

mod download;
mod local;

pub use download::{
    download_artifact, file_url_path, remote_url, ArtifactFetcher, FetchOutcome, HttpFetcher,
};
pub use local::{candidate_paths, find_existing};

use crate::cache::CacheLayout;
use crate::dependency::CancelableListener;
use crate::error::{AppManagerError, Cause, Result};
use crate::events::{EventBus, LifecycleEvent};
use crate::handler::Container;
use crate::monitor::{ChangeListener, FileChange, FileMonitor, MonitorHandle};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Signal delivered by a resolution.
///
/// `Pending` may be delivered any number of times before the single terminal
/// `Resolved` or `Failed`.
#[derive(Clone)]
pub enum ResolutionEvent {
    Pending,
    Resolved { container: Container, resource: PathBuf },
    Failed(Cause),
}

impl fmt::Debug for ResolutionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionEvent::Pending => f.write_str("Pending"),
            ResolutionEvent::Resolved { resource, .. } => {
                f.debug_struct("Resolved").field("resource", resource).finish()
            }
            ResolutionEvent::Failed(cause) => f.debug_tuple("Failed").field(cause).finish(),
        }
    }
}

/// Builds the container for a resolved artifact, creating cache directories
/// as needed
pub type ContainerBuilder = Arc<dyn Fn(&Path) -> Result<Container> + Send + Sync>;

/// Collaborators shared by every resolution run by one manager
pub struct ResolverContext {
    pub apps_dir: PathBuf,
    pub shared_apps_dir: PathBuf,
    pub cache: CacheLayout,
    pub monitor: Option<Arc<dyn FileMonitor>>,
    pub fetcher: Arc<dyn ArtifactFetcher>,
    pub events: EventBus,
    pub executor: Handle,
}

/// One resolution attempt for one application
pub struct ResourceAction {
    pid: String,
    location: String,
    context: Arc<ResolverContext>,
    build_container: ContainerBuilder,
    sink: CancelableListener<ResolutionEvent>,
    finished: AtomicBool,
    watch: Mutex<Option<MonitorHandle>>,
    cancel: CancellationToken,
}

impl ResourceAction {
    pub fn new(
        pid: impl Into<String>,
        location: impl Into<String>,
        context: Arc<ResolverContext>,
        build_container: ContainerBuilder,
        sink: CancelableListener<ResolutionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pid: pid.into(),
            location: location.into(),
            context,
            build_container,
            sink,
            finished: AtomicBool::new(false),
            watch: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Start resolving. Local hits and misses without a monitor are reported
    /// before this returns; downloads and watched misses report later.
    pub fn execute(self: &Arc<Self>) {
        if let Some(url) = remote_url(&self.location) {
            self.start_download(url);
            return;
        }

        let location = file_url_path(&self.location)
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.location.clone());
        let candidates = candidate_paths(
            &location,
            &self.context.apps_dir,
            &self.context.shared_apps_dir,
        );

        if self.resolve_local(&candidates) {
            return;
        }

        let Some(monitor) = self.context.monitor.clone() else {
            self.finish(self.not_found(candidates));
            return;
        };

        let weak = Arc::downgrade(self);
        let watched = candidates.clone();
        let listener: ChangeListener = Arc::new(move |change: FileChange| {
            if change.baseline || (change.created.is_empty() && change.modified.is_empty()) {
                return;
            }
            if let Some(action) = weak.upgrade() {
                debug!("Change seen for {}, resolving again", action.location);
                action.resolve_local(&watched);
            }
        });

        match monitor.watch(candidates.clone(), listener) {
            Ok(handle) => {
                *self.watch.lock() = Some(handle);
                if self.finished.load(Ordering::SeqCst) {
                    self.drop_watch();
                    return;
                }
            }
            Err(e) => {
                warn!("Unable to watch for {}: {}", self.location, e);
                self.finish(self.not_found(candidates));
                return;
            }
        }

        // the artifact may have appeared while the watch was being set up
        if self.resolve_local(&candidates) {
            return;
        }

        if !self.finished.load(Ordering::SeqCst) {
            self.context.events.publish(LifecycleEvent::ResolutionPending {
                pid: self.pid.clone(),
                location: self.location.clone(),
            });
            self.sink.invoke(ResolutionEvent::Pending);
        }
    }

    /// Suppress every later signal and release the watch or download
    pub fn cancel(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.sink.cancel();
        self.cancel.cancel();
        self.drop_watch();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn start_download(self: &Arc<Self>, url: Url) {
        let action = Arc::clone(self);
        let dir = self.context.cache.download_dir(&self.pid);
        info!("Downloading {} for {}", url, self.pid);

        self.context.executor.spawn(async move {
            let token = action.cancel.clone();
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Download of {} cancelled", url);
                }
                result = download_artifact(action.context.fetcher.as_ref(), &url, &dir) => {
                    let event = match result {
                        Ok(resource) => action.container_event(resource),
                        Err(e) => ResolutionEvent::Failed(e.into_cause()),
                    };
                    action.finish(event);
                }
            }
        });
    }

    /// Returns `true` once the action has completed
    fn resolve_local(&self, candidates: &[PathBuf]) -> bool {
        if self.is_finished() {
            return true;
        }
        match find_existing(candidates) {
            Some(resource) => {
                debug!("Resolved {} to {}", self.location, resource.display());
                let event = self.container_event(resource);
                self.finish(event);
                true
            }
            None => false,
        }
    }

    fn container_event(&self, resource: PathBuf) -> ResolutionEvent {
        match (self.build_container)(&resource) {
            Ok(container) => ResolutionEvent::Resolved {
                container,
                resource,
            },
            Err(e) => ResolutionEvent::Failed(e.into_cause()),
        }
    }

    fn not_found(&self, searched: Vec<PathBuf>) -> ResolutionEvent {
        ResolutionEvent::Failed(
            AppManagerError::NotFound {
                location: self.location.clone(),
                searched,
            }
            .into_cause(),
        )
    }

    fn finish(&self, event: ResolutionEvent) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.drop_watch();

        if let ResolutionEvent::Failed(cause) = &event {
            self.context.events.publish(LifecycleEvent::ResolutionFailed {
                pid: self.pid.clone(),
                error: cause.to_string(),
            });
        }
        self.sink.invoke(event);
    }

    fn drop_watch(&self) {
        let handle = self.watch.lock().take();
        if let Some(handle) = handle {
            handle.cancel();
        }
    }
}
