//! Multi-file disk storage.
//!
//! This module persists one logical, piece-aligned byte stream onto a set of
//! files. Each file has a path, a length, an offset into the stream and a
//! "requested" flag; a download may deselect individual files.
//!
//! # Overview
//!
//! Pieces may span several files, so a deselected file can share a piece
//! with a selected neighbor. Activation decides up front which deselected
//! files still need a writer because a piece-aligned write would touch them.
//! Reads and writes over the stream are then split across file boundaries,
//! with open handles kept under a fixed budget.
//!
//! # Components
//!
//! - [`MultiDiskAdaptor`] - Maps stream ranges onto files, owns all handles
//! - [`DiskWriterEntry`] - One file's writer slot and allocation flag
//! - [`FileEntry`] - Metadata about a file in the stream
//! - [`DiskWriter`] - The OS file handle primitive, pluggable via [`DiskWriterFactory`]
//! - [`MultiFileAllocationIterator`] - Chunked preallocation across files
//! - [`SingleFileAllocationIterator`] - Chunked extension of one file
//!
//! # Examples
//!
//! ```no_run
//! use piecestore::storage::{FileEntry, MultiDiskAdaptor};
//! use std::sync::atomic::AtomicBool;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let files = vec![
//!     FileEntry::new("album/cover.jpg", 1000, 0),
//!     FileEntry::new("album/track01.flac", 5000, 1000).with_requested(false),
//!     FileEntry::new("album/track02.flac", 4000, 6000),
//! ];
//!
//! let mut adaptor = MultiDiskAdaptor::new("./downloads", files, 512)?
//!     .with_max_open_files(16);
//! adaptor.open_file()?;
//!
//! // Preallocate, checking for cancellation between chunks.
//! let cancel = AtomicBool::new(false);
//! piecestore::storage::allocate_all(&mut adaptor, &cancel, |p| {
//!     println!("{}/{} bytes", p.current_length, p.total_length);
//! })?;
//!
//! // Write and read back a piece.
//! adaptor.write(&[0u8; 512], 512)?;
//! let piece = adaptor.read_bytes(512, 512)?;
//! assert_eq!(piece.len(), 512);
//!
//! adaptor.close_file()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! File paths are validated when the adaptor is configured. Paths containing
//! `..` or absolute paths are rejected.

mod activation;
mod adaptor;
mod allocation;
mod entry;
mod error;
mod file;
mod writer;

pub use activation::{activate, Activation};
pub use adaptor::{MultiDiskAdaptor, SharedDiskAdaptor};
pub use allocation::{
    allocate_all, allocate_in_background, AllocationProgress, FileAllocationIterator,
    MultiFileAllocationIterator, SingleFileAllocationIterator,
};
pub use entry::{DiskWriterEntry, WriterSlot};
pub use error::StorageError;
pub use file::{AllocationMode, FileEntry, FileSpan};
pub use writer::{
    set_file_times, DefaultDiskWriter, DefaultDiskWriterFactory, DiskWriter, DiskWriterFactory,
    WriterOptions,
};
