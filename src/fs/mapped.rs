use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{AppError, Result};

/// Read-only memory mapping of a media file.
///
/// The byte pointer and length are stable for the lifetime of the value, so
/// readers can hold offsets into the mapping across reads and seeks. The
/// mapping is dropped when the last `Arc<MappedFile>` handle goes away.
pub struct MappedFile {
    path: PathBuf,
    map: Mmap,
}

impl MappedFile {
    /// Open and map `path` read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| AppError::io(&path, e))?;

        // Safety: the mapping is private and read-only; concurrent truncation
        // of a file being streamed is outside the engine's failure model.
        let map = unsafe { Mmap::map(&file) }.map_err(|e| AppError::io(&path, e))?;

        Ok(Self { path, map })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The full mapped byte range.
    pub fn bytes(&self) -> &[u8] {
        &self.map
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("len", &self.map.len())
            .finish()
    }
}
