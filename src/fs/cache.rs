use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::mapped::MappedFile;
use crate::error::Result;

/// Process-wide cache of shared [`MappedFile`] instances, coalesced by path.
///
/// The cache stores weak handles only: sessions own the mappings, and a
/// mapping is reclaimed as soon as the last owning session drops its handle.
/// Multiple sessions streaming the same file therefore share exactly one
/// backing map without reference counting at call sites.
pub struct FileCache {
    files: Mutex<HashMap<PathBuf, Weak<MappedFile>>>,
}

impl FileCache {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the shared mapping for `path`.
    pub fn get(&self, path: impl AsRef<Path>) -> Result<Arc<MappedFile>> {
        let path = path.as_ref();
        let mut files = self.files.lock();

        if let Some(weak) = files.get(path) {
            if let Some(shared) = weak.upgrade() {
                debug!(path = %path.display(), "reusing existing mapped file");
                return Ok(shared);
            }
            // Expired weak handle, drop the stale entry.
            files.remove(path);
        }

        let mapped = Arc::new(MappedFile::open(path).map_err(|e| {
            warn!(path = %path.display(), error = %e, "failed to map file");
            e
        })?);

        files.insert(path.to_path_buf(), Arc::downgrade(&mapped));
        info!(
            path = %path.display(),
            size = mapped.len(),
            "created new mapped file"
        );

        Ok(mapped)
    }

    /// Drop the cache entry for `path` eagerly.
    ///
    /// The underlying mapping survives until the last live handle is dropped;
    /// only the path lookup is removed.
    pub fn release(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if self.files.lock().remove(path).is_some() {
            debug!(path = %path.display(), "released mapped file entry");
        }
    }

    /// Number of entries whose mapping is still alive.
    pub fn active_count(&self) -> usize {
        self.files
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Drop all cache entries.
    pub fn clear(&self) {
        self.files.lock().clear();
        info!("cleared mapped file cache");
    }
}

impl Default for FileCache {
    fn default() -> Self {
        Self::new()
    }
}
