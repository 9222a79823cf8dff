use std::borrow::Borrow;
use std::path::{Component, Path, PathBuf};

use super::error::StorageError;

/// How a file is grown toward its declared length before transfer starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationMode {
    /// Extend the file length only; blocks are materialized on first write.
    Sparse,
    /// Reserve blocks with the OS preallocation facility, falling back to
    /// a length change where it is unavailable.
    Prealloc,
    /// Write zeroes over the whole missing range.
    #[default]
    Full,
}

/// One physical file's place in the logical stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the store directory.
    pub path: PathBuf,
    pub length: u64,
    /// Start position in the logical stream.
    pub offset: u64,
    /// Whether the user selected this file for download.
    pub requested: bool,
}

/// A contiguous region of one file covered by a stream range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
    /// Position of this span inside the caller's buffer.
    pub buffer_offset: usize,
}

impl FileEntry {
    /// Creates a requested file entry.
    pub fn new(path: impl Into<PathBuf>, length: u64, offset: u64) -> Self {
        Self {
            path: path.into(),
            length,
            offset,
            requested: true,
        }
    }

    pub fn with_requested(mut self, requested: bool) -> Self {
        self.requested = requested;
        self
    }

    pub fn set_requested(&mut self, requested: bool) {
        self.requested = requested;
    }

    /// One past the last stream byte owned by this file.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.length
    }

    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end_offset()
    }

    /// Index of the piece holding this file's first byte.
    pub fn first_piece(&self, piece_length: u64) -> u64 {
        self.offset / piece_length
    }

    /// Index of the piece holding this file's last byte. A zero-length file
    /// is a point boundary and reports the piece containing its offset.
    pub fn last_piece(&self, piece_length: u64) -> u64 {
        if self.length == 0 {
            self.offset / piece_length
        } else {
            (self.end_offset() - 1) / piece_length
        }
    }
}

fn validate_file_path(file_path: &Path) -> Result<(), StorageError> {
    for component in file_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(file_path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Checks everything a file list must satisfy before it can be mapped:
/// non-empty, safe relative paths, a positive piece length and contiguous
/// ascending offsets starting at zero.
pub(crate) fn validate_layout(files: &[FileEntry], piece_length: u64) -> Result<(), StorageError> {
    if files.is_empty() {
        return Err(StorageError::Configuration("file list is empty".into()));
    }
    if piece_length == 0 {
        return Err(StorageError::Configuration("piece length must be positive".into()));
    }
    for file in files {
        validate_file_path(&file.path)?;
    }
    if files[0].offset != 0 {
        return Err(StorageError::Configuration(format!(
            "first file {} starts at offset {}, expected 0",
            files[0].path.display(),
            files[0].offset
        )));
    }
    for pair in files.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let expected = prev.offset.checked_add(prev.length).ok_or_else(|| {
            StorageError::Configuration(format!(
                "file {} overflows the stream length",
                prev.path.display()
            ))
        })?;
        if next.offset != expected {
            return Err(StorageError::Configuration(format!(
                "file {} starts at offset {}, expected {} after {}",
                next.path.display(),
                next.offset,
                expected,
                prev.path.display()
            )));
        }
    }
    if let Some(last) = files.last() {
        if last.offset.checked_add(last.length).is_none() {
            return Err(StorageError::Configuration(format!(
                "file {} overflows the stream length",
                last.path.display()
            )));
        }
    }
    Ok(())
}

/// Splits `[offset, offset + length)` into per-file spans, skipping
/// zero-length files. The range must lie inside the stream.
pub(crate) fn file_spans<F: Borrow<FileEntry>>(
    files: &[F],
    offset: u64,
    length: u64,
) -> Vec<FileSpan> {
    let mut spans = Vec::new();
    if length == 0 {
        return spans;
    }

    // First file whose end lies past `offset`; zero-length files never
    // qualify since their end equals their start.
    let first = files.partition_point(|f| f.borrow().end_offset() <= offset);

    let mut remaining = length;
    let mut current_offset = offset;
    for (file_index, file) in files.iter().enumerate().skip(first) {
        let file = file.borrow();
        if remaining == 0 {
            break;
        }
        if !file.contains_offset(current_offset) {
            continue;
        }

        let file_offset = current_offset - file.offset;
        let take = remaining.min(file.end_offset() - current_offset);

        spans.push(FileSpan {
            file_index,
            file_offset,
            length: take,
            buffer_offset: (current_offset - offset) as usize,
        });

        current_offset += take;
        remaining -= take;
    }

    spans
}
