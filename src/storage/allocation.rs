//! Incremental file preallocation.
//!
//! Allocation is driven in bounded chunks so that a caller can report
//! progress and honor cancellation between calls. Extension only ever grows
//! a file toward its declared length; an interrupted run leaves a valid
//! prefix behind and the next run resumes from the current file size.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use super::adaptor::{MultiDiskAdaptor, SharedDiskAdaptor};
use super::error::StorageError;
use super::file::AllocationMode;
use super::writer::DiskWriter;
use crate::constants::{FILE_ALLOCATION_CHUNK_SIZE, PREALLOCATION_CHUNK_SIZE};

/// A resumable process that extends storage one bounded unit at a time.
pub trait FileAllocationIterator {
    /// What a chunk of work operates on.
    type Target: ?Sized;

    fn allocate_chunk(&mut self, target: &mut Self::Target) -> Result<(), StorageError>;

    fn finished(&self) -> bool;

    fn current_length(&self) -> u64;

    fn total_length(&self) -> u64;
}

/// Extends one file from `begin` to `total_length`.
#[derive(Debug)]
pub struct SingleFileAllocationIterator {
    offset: u64,
    total_length: u64,
    mode: AllocationMode,
    buffer: Vec<u8>,
}

impl SingleFileAllocationIterator {
    pub fn new(begin: u64, total_length: u64, mode: AllocationMode) -> Self {
        Self {
            offset: begin,
            total_length,
            mode,
            buffer: Vec::new(),
        }
    }

    /// Prepares the zero-fill buffer. Called implicitly by the first chunk.
    pub fn init(&mut self) {
        if self.mode == AllocationMode::Full && self.buffer.is_empty() {
            let remaining = self.total_length.saturating_sub(self.offset);
            let len = FILE_ALLOCATION_CHUNK_SIZE.min(remaining).max(1);
            self.buffer = vec![0u8; len as usize];
        }
    }
}

impl FileAllocationIterator for SingleFileAllocationIterator {
    type Target = dyn DiskWriter;

    fn allocate_chunk(&mut self, writer: &mut Self::Target) -> Result<(), StorageError> {
        if self.finished() {
            return Ok(());
        }
        let remaining = self.total_length - self.offset;

        match self.mode {
            AllocationMode::Sparse => {
                if writer.size()? < self.total_length {
                    writer.truncate(self.total_length)?;
                }
                self.offset = self.total_length;
            }
            AllocationMode::Prealloc => {
                let len = remaining.min(PREALLOCATION_CHUNK_SIZE);
                writer.allocate(self.offset, len)?;
                self.offset += len;
            }
            AllocationMode::Full => {
                self.init();
                let len = remaining.min(self.buffer.len() as u64);
                writer.write_data(&self.buffer[..len as usize], self.offset)?;
                self.offset += len;
            }
        }
        Ok(())
    }

    fn finished(&self) -> bool {
        self.offset >= self.total_length
    }

    fn current_length(&self) -> u64 {
        self.offset
    }

    fn total_length(&self) -> u64 {
        self.total_length
    }
}

/// Snapshot of allocation progress, reported between chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocationProgress {
    /// File being extended, if any.
    pub file_index: Option<usize>,
    /// Progress within that file only.
    pub current_length: u64,
    pub total_length: u64,
    /// Files still queued behind the current one.
    pub files_remaining: usize,
}

/// Walks every file that needs allocation, extending them one at a time.
///
/// The work list is a snapshot of entry indices taken at construction. It
/// is consumed through a cursor, so [`remaining_entries`] stays inspectable
/// and [`reset`] rewinds it for another pass.
///
/// [`remaining_entries`]: Self::remaining_entries
/// [`reset`]: Self::reset
#[derive(Debug)]
pub struct MultiFileAllocationIterator {
    queue: Vec<usize>,
    next: usize,
    current: Option<(usize, SingleFileAllocationIterator)>,
    mode: AllocationMode,
}

impl MultiFileAllocationIterator {
    pub fn new(adaptor: &MultiDiskAdaptor) -> Self {
        let queue = adaptor
            .disk_writer_entries()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.needs_file_allocation())
            .map(|(i, _)| i)
            .collect();
        Self {
            queue,
            next: 0,
            current: None,
            mode: adaptor.allocation_mode(),
        }
    }

    /// Entry indices not yet picked up.
    pub fn remaining_entries(&self) -> &[usize] {
        &self.queue[self.next..]
    }

    /// Rewinds the work list. Files already at full length are skipped on
    /// the next pass.
    pub fn reset(&mut self) {
        self.next = 0;
        self.current = None;
    }

    pub fn progress(&self) -> AllocationProgress {
        AllocationProgress {
            file_index: self.current.as_ref().map(|(index, _)| *index),
            current_length: self.current_length(),
            total_length: self.total_length(),
            files_remaining: self.remaining_entries().len(),
        }
    }

    fn current_busy(&self) -> bool {
        self.current.as_ref().is_some_and(|(_, iter)| !iter.finished())
    }

    // Pulls queued entries until one needs extending or the queue runs dry.
    fn select_next(&mut self, adaptor: &mut MultiDiskAdaptor) -> Result<(), StorageError> {
        while !self.current_busy() {
            let Some(&index) = self.queue.get(self.next) else {
                return Ok(());
            };
            self.next += 1;
            self.current = None;

            adaptor.open_if_not_open(index)?;
            let entry = adaptor.entry_mut(index)?;
            // Zero-fill writes from an unaligned buffer, which O_DIRECT rejects.
            if self.mode != AllocationMode::Full {
                entry.enable_direct_io();
            }
            let declared = entry.file_entry().length;
            let size = entry.size()?;

            if entry.needs_file_allocation() && size < declared {
                tracing::debug!(
                    path = %entry.file_path().display(),
                    from = size,
                    to = declared,
                    "allocating file"
                );
                let mut iter = SingleFileAllocationIterator::new(size, declared, self.mode);
                iter.init();
                self.current = Some((index, iter));
            } else {
                entry.disable_direct_io();
            }
        }
        Ok(())
    }
}

impl FileAllocationIterator for MultiFileAllocationIterator {
    type Target = MultiDiskAdaptor;

    /// Advances allocation by one bounded unit. A failure abandons the file
    /// being extended; the next call moves on to the following one.
    fn allocate_chunk(&mut self, adaptor: &mut MultiDiskAdaptor) -> Result<(), StorageError> {
        self.select_next(adaptor)?;

        let Some((index, iter)) = self.current.as_mut() else {
            return Ok(());
        };
        if iter.finished() {
            return Ok(());
        }
        let index = *index;

        if let Err(e) = extend_file(adaptor, index, iter) {
            tracing::warn!(file_index = index, error = %e, "file allocation aborted");
            self.current = None;
            return Err(e);
        }
        if iter.finished() {
            tracing::debug!(file_index = index, length = iter.total_length(), "file allocated");
        }
        Ok(())
    }

    fn finished(&self) -> bool {
        self.next >= self.queue.len() && !self.current_busy()
    }

    fn current_length(&self) -> u64 {
        self.current
            .as_ref()
            .map_or(0, |(_, iter)| iter.current_length())
    }

    fn total_length(&self) -> u64 {
        self.current
            .as_ref()
            .map_or(0, |(_, iter)| iter.total_length())
    }
}

// The handle may have been evicted since the previous chunk, so reopen.
fn extend_file(
    adaptor: &mut MultiDiskAdaptor,
    index: usize,
    iter: &mut SingleFileAllocationIterator,
) -> Result<(), StorageError> {
    adaptor.open_if_not_open(index)?;
    let entry = adaptor.entry_mut(index)?;
    let outcome = entry
        .writer_mut()
        .and_then(|writer| iter.allocate_chunk(writer));
    if outcome.is_err() || iter.finished() {
        entry.disable_direct_io();
    }
    outcome
}

/// Drives allocation of every file to completion.
///
/// `cancel` is checked between chunks; when it is set the loop stops with
/// [`StorageError::Cancelled`] and the files keep whatever length they
/// reached. `on_progress` runs after every chunk.
pub fn allocate_all<F>(
    adaptor: &mut MultiDiskAdaptor,
    cancel: &AtomicBool,
    mut on_progress: F,
) -> Result<(), StorageError>
where
    F: FnMut(&AllocationProgress),
{
    let mut iter = adaptor.file_allocation_iterator();
    while !iter.finished() {
        if cancel.load(Ordering::Relaxed) {
            tracing::info!(remaining = iter.remaining_entries().len(), "file allocation cancelled");
            return Err(StorageError::Cancelled);
        }
        iter.allocate_chunk(adaptor)?;
        on_progress(&iter.progress());
    }
    Ok(())
}

/// Runs allocation on the blocking thread pool.
///
/// The adaptor lock is taken once per chunk, so reads and writes from other
/// tasks interleave with allocation. Progress is published on `progress`.
pub async fn allocate_in_background(
    adaptor: SharedDiskAdaptor,
    cancel: Arc<AtomicBool>,
    progress: watch::Sender<AllocationProgress>,
) -> Result<(), StorageError> {
    tokio::task::spawn_blocking(move || {
        let mut iter = adaptor.lock().file_allocation_iterator();
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(StorageError::Cancelled);
            }
            {
                let mut guard = adaptor.lock();
                if iter.finished() {
                    return Ok(());
                }
                iter.allocate_chunk(&mut guard)?;
            }
            // Receivers may all be gone; allocation continues regardless.
            let _ = progress.send(iter.progress());
        }
    })
    .await
    .map_err(|e| StorageError::TaskFailed(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::writer::{DefaultDiskWriter, WriterOptions};
    use crate::storage::FileEntry;
    use tempfile::TempDir;

    fn open_writer(temp: &TempDir) -> DefaultDiskWriter {
        let mut writer = DefaultDiskWriter::new(temp.path().join("f"), WriterOptions::default());
        writer.open_file().unwrap();
        writer
    }

    #[test]
    fn test_single_file_zero_fill_in_chunks() {
        let temp = TempDir::new().unwrap();
        let mut writer = open_writer(&temp);
        let total = FILE_ALLOCATION_CHUNK_SIZE * 2 + 10;
        let mut iter = SingleFileAllocationIterator::new(0, total, AllocationMode::Full);
        iter.init();

        let mut calls = 0;
        while !iter.finished() {
            iter.allocate_chunk(&mut writer).unwrap();
            calls += 1;
        }
        assert_eq!(calls, 3);
        assert_eq!(writer.size().unwrap(), total);
        assert_eq!(iter.current_length(), total);
    }

    #[test]
    fn test_single_file_resumes_from_existing_prefix() {
        let temp = TempDir::new().unwrap();
        let mut writer = open_writer(&temp);
        writer.write_data(b"keep", 0).unwrap();

        let mut iter = SingleFileAllocationIterator::new(4, 100, AllocationMode::Full);
        while !iter.finished() {
            iter.allocate_chunk(&mut writer).unwrap();
        }
        let mut buf = [0u8; 4];
        writer.read_data(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"keep");
        assert_eq!(writer.size().unwrap(), 100);
    }

    #[test]
    fn test_single_file_sparse_and_prealloc() {
        for mode in [AllocationMode::Sparse, AllocationMode::Prealloc] {
            let temp = TempDir::new().unwrap();
            let mut writer = open_writer(&temp);
            let mut iter = SingleFileAllocationIterator::new(0, 1 << 20, mode);
            iter.allocate_chunk(&mut writer).unwrap();
            assert!(iter.finished());
            assert_eq!(writer.size().unwrap(), 1 << 20);
        }
    }

    #[test]
    fn test_multi_file_skips_entries_already_complete() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a"), vec![1u8; 8]).unwrap();
        let files = vec![
            FileEntry::new("a", 8, 0),
            FileEntry::new("b", 16, 8),
            FileEntry::new("c", 0, 24),
        ];
        let mut adaptor = MultiDiskAdaptor::new(temp.path(), files, 4).unwrap();
        let mut iter = adaptor.file_allocation_iterator();
        assert_eq!(iter.remaining_entries(), &[0, 1, 2]);
        assert_eq!(iter.current_length(), 0);
        assert_eq!(iter.total_length(), 0);

        iter.allocate_chunk(&mut adaptor).unwrap();
        assert_eq!(iter.remaining_entries(), &[2]);
        assert_eq!(iter.total_length(), 16);
        assert_eq!(iter.current_length(), 16);

        while !iter.finished() {
            iter.allocate_chunk(&mut adaptor).unwrap();
        }
        assert!(iter.remaining_entries().is_empty());
        assert_eq!(std::fs::metadata(temp.path().join("a")).unwrap().len(), 8);
        assert_eq!(std::fs::metadata(temp.path().join("b")).unwrap().len(), 16);
        assert!(temp.path().join("c").is_file());
    }

    #[test]
    fn test_multi_file_reset_reruns_queue() {
        let temp = TempDir::new().unwrap();
        let files = vec![FileEntry::new("a", 8, 0), FileEntry::new("b", 8, 8)];
        let mut adaptor = MultiDiskAdaptor::new(temp.path(), files, 4).unwrap();
        let mut iter = adaptor.file_allocation_iterator();
        while !iter.finished() {
            iter.allocate_chunk(&mut adaptor).unwrap();
        }
        iter.reset();
        assert_eq!(iter.remaining_entries(), &[0, 1]);
        assert!(!iter.finished());
        while !iter.finished() {
            iter.allocate_chunk(&mut adaptor).unwrap();
        }
        assert_eq!(adaptor.size().unwrap(), 16);
    }

    #[test]
    fn test_allocate_all_reports_progress_and_honors_cancel() {
        let temp = TempDir::new().unwrap();
        let files = vec![
            FileEntry::new("a", FILE_ALLOCATION_CHUNK_SIZE * 2, 0),
            FileEntry::new("b", 100, FILE_ALLOCATION_CHUNK_SIZE * 2),
        ];
        let mut adaptor = MultiDiskAdaptor::new(temp.path(), files.clone(), 1024).unwrap();

        let cancel = AtomicBool::new(true);
        assert!(matches!(
            allocate_all(&mut adaptor, &cancel, |_| {}),
            Err(StorageError::Cancelled)
        ));

        cancel.store(false, Ordering::Relaxed);
        let mut reports = Vec::new();
        allocate_all(&mut adaptor, &cancel, |p| reports.push(*p)).unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].file_index, Some(0));
        assert_eq!(reports[0].current_length, FILE_ALLOCATION_CHUNK_SIZE);
        assert_eq!(reports[2].file_index, Some(1));
        assert_eq!(reports[2].current_length, 100);
        assert_eq!(adaptor.size().unwrap(), FILE_ALLOCATION_CHUNK_SIZE * 2 + 100);
    }

    #[test]
    fn test_allocation_with_direct_io_allowed() {
        for mode in [AllocationMode::Full, AllocationMode::Prealloc, AllocationMode::Sparse] {
            let temp = TempDir::new().unwrap();
            let files = vec![FileEntry::new("a", 100, 0), FileEntry::new("b", 5000, 100)];
            let mut adaptor = MultiDiskAdaptor::new(temp.path(), files, 1024)
                .unwrap()
                .with_direct_io_allowed(true)
                .with_allocation_mode(mode);

            let mut iter = adaptor.file_allocation_iterator();
            while !iter.finished() {
                iter.allocate_chunk(&mut adaptor).unwrap();
            }
            assert_eq!(std::fs::metadata(temp.path().join("a")).unwrap().len(), 100);
            assert_eq!(std::fs::metadata(temp.path().join("b")).unwrap().len(), 5000);

            adaptor.write(b"tail", 5096).unwrap();
            assert_eq!(adaptor.read_bytes(5096, 4).unwrap().as_ref(), b"tail");
        }
    }

    #[tokio::test]
    async fn test_allocate_in_background() {
        let temp = TempDir::new().unwrap();
        let files = vec![FileEntry::new("a", 5000, 0), FileEntry::new("b", 3000, 5000)];
        let shared = MultiDiskAdaptor::new(temp.path(), files, 1024)
            .unwrap()
            .into_shared();
        let (tx, rx) = watch::channel(AllocationProgress::default());

        allocate_in_background(shared.clone(), Arc::new(AtomicBool::new(false)), tx)
            .await
            .unwrap();

        assert_eq!(rx.borrow().file_index, Some(1));
        assert_eq!(shared.lock().size().unwrap(), 8000);
    }
}
