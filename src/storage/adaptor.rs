use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;

use super::activation::activate;
use super::allocation::MultiFileAllocationIterator;
use super::entry::DiskWriterEntry;
use super::error::StorageError;
use super::file::{file_spans, validate_layout, AllocationMode, FileEntry, FileSpan};
use super::writer::{set_file_times, DefaultDiskWriterFactory, DiskWriterFactory, WriterOptions};
use crate::constants::DEFAULT_MAX_OPEN_FILES;

/// A [`MultiDiskAdaptor`] behind a lock, for callers on several threads.
pub type SharedDiskAdaptor = Arc<Mutex<MultiDiskAdaptor>>;

type OpenFn =
    fn(&mut DiskWriterEntry, &dyn DiskWriterFactory, WriterOptions) -> Result<(), StorageError>;

/// Persists one logical byte stream onto a list of files.
///
/// Activation runs once at construction and decides which files get a
/// writer. Reads and writes are split across file boundaries; ranges over
/// inactive files are skipped. At most `max_open_files` handles are open at
/// any time, the least recently used one being closed to make room.
///
/// The adaptor has no internal locking. Share it through
/// [`SharedDiskAdaptor`] when more than one caller needs it.
pub struct MultiDiskAdaptor {
    store_dir: PathBuf,
    base_dir: Option<PathBuf>,
    piece_length: u64,
    total_length: u64,
    files: Vec<Arc<FileEntry>>,
    entries: Vec<DiskWriterEntry>,
    max_open_files: usize,
    // Front is least recently used.
    open_order: VecDeque<usize>,
    allocation_mode: AllocationMode,
    writer_factory: Arc<dyn DiskWriterFactory>,
    writer_options: WriterOptions,
    eviction_close_failures: u64,
}

impl MultiDiskAdaptor {
    /// Validates the file list and computes which files are active.
    ///
    /// Fails with [`StorageError::Configuration`] when the list is empty,
    /// `piece_length` is zero or the offsets are not contiguous, and with
    /// [`StorageError::PathTraversal`] when a path escapes `store_dir`.
    pub fn new(
        store_dir: impl Into<PathBuf>,
        files: Vec<FileEntry>,
        piece_length: u64,
    ) -> Result<Self, StorageError> {
        validate_layout(&files, piece_length)?;

        let store_dir = store_dir.into();
        let activations = activate(&files, piece_length);
        let files: Vec<Arc<FileEntry>> = files.into_iter().map(Arc::new).collect();
        let entries = files
            .iter()
            .zip(activations)
            .map(|(file, activation)| {
                DiskWriterEntry::new(
                    Arc::clone(file),
                    store_dir.join(&file.path),
                    activation.active,
                    activation.needs_file_allocation,
                )
            })
            .collect();
        let total_length = files.last().map(|f| f.end_offset()).unwrap_or(0);

        tracing::debug!(
            files = files.len(),
            piece_length,
            total_length,
            "configured multi-file storage"
        );

        Ok(Self {
            store_dir,
            base_dir: None,
            piece_length,
            total_length,
            files,
            entries,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            open_order: VecDeque::new(),
            allocation_mode: AllocationMode::default(),
            writer_factory: Arc::new(DefaultDiskWriterFactory),
            writer_options: WriterOptions::default(),
            eviction_close_failures: 0,
        })
    }

    /// Directory under the store directory that `open_file` creates even
    /// when no file in it is active.
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    /// Maximum number of simultaneously open handles, at least one.
    pub fn with_max_open_files(mut self, max_open_files: usize) -> Self {
        self.max_open_files = max_open_files.max(1);
        self
    }

    pub fn with_allocation_mode(mut self, mode: AllocationMode) -> Self {
        self.allocation_mode = mode;
        self
    }

    pub fn with_writer_factory(mut self, factory: Arc<dyn DiskWriterFactory>) -> Self {
        self.writer_factory = factory;
        self
    }

    pub fn with_direct_io_allowed(mut self, allowed: bool) -> Self {
        self.writer_options.direct_io_allowed = allowed;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.writer_options.read_only = read_only;
        self
    }

    pub fn into_shared(self) -> SharedDiskAdaptor {
        Arc::new(Mutex::new(self))
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn allocation_mode(&self) -> AllocationMode {
        self.allocation_mode
    }

    pub fn max_open_files(&self) -> usize {
        self.max_open_files
    }

    pub fn open_file_count(&self) -> usize {
        self.open_order.len()
    }

    /// Number of handles whose close failed while being evicted. Such a
    /// handle may have leaked.
    pub fn eviction_close_failures(&self) -> u64 {
        self.eviction_close_failures
    }

    pub fn file_entries(&self) -> &[Arc<FileEntry>] {
        &self.files
    }

    pub fn disk_writer_entries(&self) -> &[DiskWriterEntry] {
        &self.entries
    }

    pub(crate) fn entry_mut(&mut self, index: usize) -> Result<&mut DiskWriterEntry, StorageError> {
        self.entries
            .get_mut(index)
            .ok_or(StorageError::InvalidFileIndex(index))
    }

    /// Opens entry `index` unless it already holds a handle, evicting the
    /// least recently used handle when the budget is exhausted.
    pub fn open_if_not_open(&mut self, index: usize) -> Result<(), StorageError> {
        if self.entry_mut(index)?.is_open() {
            self.touch(index);
            return Ok(());
        }
        self.open_entry_with(index, DiskWriterEntry::open_file)
    }

    fn open_entry_with(&mut self, index: usize, open: OpenFn) -> Result<(), StorageError> {
        let entry = self.entry_mut(index)?;
        if !entry.is_active() {
            return Err(StorageError::NotOpen(entry.file_path().to_path_buf()));
        }

        if entry.is_open() {
            self.open_order.retain(|&i| i != index);
        } else {
            self.make_room();
        }

        let entry = &mut self.entries[index];
        open(entry, self.writer_factory.as_ref(), self.writer_options)?;
        tracing::debug!(path = %entry.file_path().display(), "opened file handle");
        self.open_order.push_back(index);
        Ok(())
    }

    fn make_room(&mut self) {
        while self.open_order.len() >= self.max_open_files {
            let Some(victim) = self.open_order.pop_front() else {
                break;
            };
            let entry = &mut self.entries[victim];
            match entry.close_file() {
                Ok(()) => {
                    tracing::debug!(path = %entry.file_path().display(), "evicted file handle")
                }
                Err(e) => {
                    self.eviction_close_failures += 1;
                    tracing::warn!(
                        path = %entry.file_path().display(),
                        error = %e,
                        failures = self.eviction_close_failures,
                        "failed to close evicted file handle"
                    );
                }
            }
        }
    }

    fn touch(&mut self, index: usize) {
        if self.open_order.back() == Some(&index) {
            return;
        }
        self.open_order.retain(|&i| i != index);
        self.open_order.push_back(index);
    }

    fn create_dirs(&self) -> Result<(), StorageError> {
        let dir = match &self.base_dir {
            Some(base) => self.store_dir.join(base),
            None => self.store_dir.clone(),
        };
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))
    }

    fn active_indices(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_active())
            .map(|(i, _)| i)
            .collect()
    }

    /// Opens every active file, creating missing ones. Zero-length files
    /// are materialized here since no write ever reaches them.
    pub fn open_file(&mut self) -> Result<(), StorageError> {
        self.create_dirs()?;
        for index in self.active_indices() {
            self.open_if_not_open(index)?;
        }
        Ok(())
    }

    /// Like [`open_file`](Self::open_file), but truncates every active file
    /// to zero first.
    pub fn init_and_open_file(&mut self) -> Result<(), StorageError> {
        self.create_dirs()?;
        for index in self.active_indices() {
            self.open_entry_with(index, DiskWriterEntry::init_and_open_file)?;
        }
        Ok(())
    }

    /// Opens the active files that already exist, creating nothing.
    pub fn open_existing_file(&mut self) -> Result<(), StorageError> {
        for index in self.active_indices() {
            if self.entries[index].file_exists() {
                self.open_entry_with(index, DiskWriterEntry::open_existing_file)?;
            }
        }
        Ok(())
    }

    /// Closes every open handle. All handles are closed even if some fail;
    /// the first failure is returned.
    pub fn close_file(&mut self) -> Result<(), StorageError> {
        let mut first_err = None;
        while let Some(index) = self.open_order.pop_front() {
            if let Err(e) = self.entries[index].close_file() {
                tracing::warn!(
                    path = %self.entries[index].file_path().display(),
                    error = %e,
                    "failed to close file handle"
                );
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Whether any active file exists on disk.
    pub fn file_exists(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.is_active() && e.file_exists())
    }

    fn check_range(&self, offset: u64, length: usize) -> Result<(), StorageError> {
        let length = length as u64;
        match offset.checked_add(length) {
            Some(end) if end <= self.total_length => Ok(()),
            _ => Err(StorageError::OutOfRange {
                offset,
                length,
                total: self.total_length,
            }),
        }
    }

    /// Splits a stream range into per-file spans, inactive files included.
    pub fn file_spans(&self, offset: u64, length: u64) -> Result<Vec<FileSpan>, StorageError> {
        let len = usize::try_from(length).map_err(|_| StorageError::OutOfRange {
            offset,
            length,
            total: self.total_length,
        })?;
        self.check_range(offset, len)?;
        Ok(file_spans(&self.files, offset, length))
    }

    /// Reads `buf.len()` stream bytes starting at `offset`.
    ///
    /// Regions belonging to inactive files are left untouched. Returns the
    /// number of bytes read from active files, which is short when a file
    /// has not been written up to its declared length.
    pub fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        self.check_range(offset, buf.len())?;

        let mut total = 0;
        for span in file_spans(&self.files, offset, buf.len() as u64) {
            if !self.entries[span.file_index].is_active() {
                tracing::trace!(file_index = span.file_index, "skipping read of inactive file");
                continue;
            }
            self.open_if_not_open(span.file_index)?;
            let region = &mut buf[span.buffer_offset..span.buffer_offset + span.length as usize];
            let writer = self.entries[span.file_index].writer_mut()?;
            total += writer.read_data(region, span.file_offset)?;
        }
        Ok(total)
    }

    /// Reads `length` stream bytes into a new buffer. Inactive regions and
    /// unwritten tails read as zeroes.
    pub fn read_bytes(&mut self, offset: u64, length: usize) -> Result<Bytes, StorageError> {
        let mut buf = vec![0u8; length];
        self.read(&mut buf, offset)?;
        Ok(Bytes::from(buf))
    }

    /// Writes `data` at stream position `offset`. Bytes falling into
    /// inactive files are dropped.
    pub fn write(&mut self, data: &[u8], offset: u64) -> Result<(), StorageError> {
        self.check_range(offset, data.len())?;

        for span in file_spans(&self.files, offset, data.len() as u64) {
            if !self.entries[span.file_index].is_active() {
                tracing::trace!(file_index = span.file_index, "dropping write to inactive file");
                continue;
            }
            self.open_if_not_open(span.file_index)?;
            let chunk = &data[span.buffer_offset..span.buffer_offset + span.length as usize];
            let writer = self.entries[span.file_index].writer_mut()?;
            writer.write_data(chunk, span.file_offset)?;
        }
        Ok(())
    }

    /// Sum of the on-disk sizes of all active files, opening them as needed.
    pub fn size(&mut self) -> Result<u64, StorageError> {
        let mut size = 0;
        for index in self.active_indices() {
            self.open_if_not_open(index)?;
            size += self.entries[index].size()?;
        }
        Ok(size)
    }

    /// Sets access and modification times on every requested file that
    /// exists. Missing, deselected and failing files are skipped. Returns
    /// the number of files updated.
    pub fn utime(&mut self, accessed: SystemTime, modified: SystemTime) -> usize {
        let mut updated = 0;
        for entry in &mut self.entries {
            if !entry.file_entry().requested || !entry.file_exists() {
                continue;
            }
            let result = match entry.writer_mut() {
                Ok(writer) => writer.set_times(accessed, modified),
                Err(_) => set_file_times(entry.file_path(), accessed, modified),
            };
            match result {
                Ok(()) => updated += 1,
                Err(e) => tracing::warn!(
                    path = %entry.file_path().display(),
                    error = %e,
                    "failed to set file times"
                ),
            }
        }
        updated
    }

    /// Truncates every active file that grew past its declared length.
    /// Active files that were never opened are opened and truncated too.
    /// Files that do not exist are not created.
    pub fn cut_trailing_garbage(&mut self) -> Result<(), StorageError> {
        for index in self.active_indices() {
            let entry = &self.entries[index];
            let declared = entry.file_entry().length;
            let on_disk = match std::fs::metadata(entry.file_path()) {
                Ok(metadata) if metadata.is_file() => metadata.len(),
                _ => continue,
            };
            if on_disk <= declared {
                continue;
            }

            self.open_if_not_open(index)?;
            let entry = &mut self.entries[index];
            entry.writer_mut()?.truncate(declared)?;
            tracing::info!(
                path = %entry.file_path().display(),
                from = on_disk,
                to = declared,
                "cut trailing garbage"
            );
        }
        Ok(())
    }

    /// Starts preallocation of every file that needs it.
    pub fn file_allocation_iterator(&self) -> MultiFileAllocationIterator {
        MultiFileAllocationIterator::new(self)
    }
}

impl std::fmt::Debug for MultiDiskAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiDiskAdaptor")
            .field("store_dir", &self.store_dir)
            .field("piece_length", &self.piece_length)
            .field("total_length", &self.total_length)
            .field("entries", &self.entries)
            .field("max_open_files", &self.max_open_files)
            .field("open_order", &self.open_order)
            .finish_non_exhaustive()
    }
}
