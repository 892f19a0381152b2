use std::path::PathBuf;

use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error [{path}]: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid media [{path}]: {reason}")]
    InvalidMedia { path: PathBuf, reason: String },

    #[error("Matroska demux error: {0}")]
    Mkv(#[from] matroska_demuxer::DemuxError),

    #[error("Session start failed [{session_id}]: {reason}")]
    SessionStart { session_id: String, reason: String },

    #[error("Stream registration failed: {0}")]
    StreamRegistration(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Wrap an IO error together with the path it arose on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, AppError>;
