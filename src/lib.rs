//! piecestore - file mapping and space allocation for download engines
//!
//! This library persists a piece-aligned byte stream onto a set of files,
//! honoring per-file selection, a bounded number of open handles, and
//! incremental, cancellable preallocation.
//!
//! # Modules
//!
//! - [`storage`] - Stream-to-file mapping, handle budget, preallocation
//! - [`constants`] - Tuning parameters

pub mod constants;
pub mod storage;

pub use storage::{
    AllocationMode, DiskWriter, DiskWriterEntry, FileAllocationIterator, FileEntry,
    MultiDiskAdaptor, MultiFileAllocationIterator, SharedDiskAdaptor, StorageError,
};
