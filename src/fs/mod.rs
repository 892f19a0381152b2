//! Memory-mapped media file access
//!
//! Media files are mapped read-only once per path and shared between all
//! sessions streaming the same file. The [`FileCache`] keeps weak handles so a
//! mapping lives exactly as long as at least one session holds it.

pub mod cache;
pub mod mapped;

pub use cache::FileCache;
pub use mapped::MappedFile;
