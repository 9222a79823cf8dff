use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("range out of bounds: offset {offset}, length {length}, total length {total}")]
    OutOfRange { offset: u64, length: u64, total: u64 },

    #[error("invalid file index: {0}")]
    InvalidFileIndex(usize),

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),

    #[error("file not open: {}", .0.display())]
    NotOpen(PathBuf),

    #[error("storage is read-only: {}", .0.display())]
    ReadOnly(PathBuf),

    #[error("file allocation cancelled")]
    Cancelled,

    #[error("allocation task failed: {0}")]
    TaskFailed(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}
