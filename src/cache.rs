use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CACHE_DIR: &str = "cache";
const CACHE_ADAPT_DIR: &str = "cacheAdapt";
const CACHE_OVERLAY_DIR: &str = "cacheOverlay";
const DOWNLOAD_DIR: &str = "download";

/// On-disk cache layout shared by all applications.
///
/// Every application owns one subdirectory, named after its configuration
/// pid, under each of `cache/`, `cacheAdapt/` and `cacheOverlay/`.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

/// Cache directories owned by one application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCacheDirs {
    pub cache: PathBuf,
    pub adapt: PathBuf,
    pub overlay: PathBuf,
}

impl CacheLayout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Paths for `pid` without touching the filesystem
    pub fn dirs_for(&self, pid: &str) -> AppCacheDirs {
        AppCacheDirs {
            cache: self.root.join(CACHE_DIR).join(pid),
            adapt: self.root.join(CACHE_ADAPT_DIR).join(pid),
            overlay: self.root.join(CACHE_OVERLAY_DIR).join(pid),
        }
    }

    /// Create the cache directories for `pid` if missing
    pub fn ensure_dirs(&self, pid: &str) -> Result<AppCacheDirs> {
        let dirs = self.dirs_for(pid);
        for dir in [&dirs.cache, &dirs.adapt, &dirs.overlay] {
            std::fs::create_dir_all(dir)?;
        }
        debug!("Cache directories ready for {}", pid);
        Ok(dirs)
    }

    /// Directory receiving artifacts downloaded for `pid`
    pub fn download_dir(&self, pid: &str) -> PathBuf {
        self.root.join(DOWNLOAD_DIR).join(pid)
    }

    /// Delete every cache directory owned by `pid`
    pub fn clean(&self, pid: &str) -> Result<()> {
        let dirs = self.dirs_for(pid);
        for dir in [&dirs.cache, &dirs.adapt, &dirs.overlay, &self.download_dir(pid)] {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => debug!("Removed cache directory {}", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to remove cache directory {}: {}", dir.display(), e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_keyed_by_pid() {
        let layout = CacheLayout::new("/work");
        let dirs = layout.dirs_for("app-7");
        assert_eq!(dirs.cache, PathBuf::from("/work/cache/app-7"));
        assert_eq!(dirs.adapt, PathBuf::from("/work/cacheAdapt/app-7"));
        assert_eq!(dirs.overlay, PathBuf::from("/work/cacheOverlay/app-7"));
    }

    #[test]
    fn test_ensure_and_clean() {
        let temp = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(temp.path());

        let dirs = layout.ensure_dirs("a").unwrap();
        assert!(dirs.cache.is_dir());
        assert!(dirs.adapt.is_dir());
        assert!(dirs.overlay.is_dir());
        std::fs::write(dirs.cache.join("state.bin"), b"x").unwrap();

        let other = layout.ensure_dirs("b").unwrap();
        layout.clean("a").unwrap();
        assert!(!dirs.cache.exists());
        assert!(other.cache.exists());

        // cleaning twice is fine
        layout.clean("a").unwrap();
    }
}
