use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::StorageError;
use super::file::FileEntry;
use super::writer::{DiskWriter, DiskWriterFactory, WriterOptions};

/// Ownership slot for an entry's writer.
///
/// `Inactive` entries never receive a writer. `Closed` entries are active
/// but hold no handle; the writer is created on open and dropped on close.
pub enum WriterSlot {
    Inactive,
    Closed,
    Open(Box<dyn DiskWriter>),
}

impl fmt::Debug for WriterSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriterSlot::Inactive => f.write_str("Inactive"),
            WriterSlot::Closed => f.write_str("Closed"),
            WriterSlot::Open(_) => f.write_str("Open"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OpenMode {
    CreateIfMissing,
    Truncate,
    Existing,
}

/// Pairs a [`FileEntry`] with the writer that persists it.
#[derive(Debug)]
pub struct DiskWriterEntry {
    file_entry: Arc<FileEntry>,
    file_path: PathBuf,
    slot: WriterSlot,
    needs_file_allocation: bool,
}

impl DiskWriterEntry {
    pub(crate) fn new(
        file_entry: Arc<FileEntry>,
        file_path: PathBuf,
        active: bool,
        needs_file_allocation: bool,
    ) -> Self {
        Self {
            file_entry,
            file_path,
            slot: if active {
                WriterSlot::Closed
            } else {
                WriterSlot::Inactive
            },
            needs_file_allocation,
        }
    }

    pub fn file_entry(&self) -> &Arc<FileEntry> {
        &self.file_entry
    }

    /// Location on disk: the store directory joined with the entry path.
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn slot(&self) -> &WriterSlot {
        &self.slot
    }

    /// Whether this entry was given a writer during activation.
    pub fn is_active(&self) -> bool {
        !matches!(self.slot, WriterSlot::Inactive)
    }

    pub fn is_open(&self) -> bool {
        matches!(self.slot, WriterSlot::Open(_))
    }

    pub fn needs_file_allocation(&self) -> bool {
        self.needs_file_allocation
    }

    pub fn file_exists(&self) -> bool {
        self.file_path.is_file()
    }

    pub(crate) fn open_file(
        &mut self,
        factory: &dyn DiskWriterFactory,
        options: WriterOptions,
    ) -> Result<(), StorageError> {
        self.open_with(factory, options, OpenMode::CreateIfMissing)
    }

    pub(crate) fn init_and_open_file(
        &mut self,
        factory: &dyn DiskWriterFactory,
        options: WriterOptions,
    ) -> Result<(), StorageError> {
        self.open_with(factory, options, OpenMode::Truncate)
    }

    pub(crate) fn open_existing_file(
        &mut self,
        factory: &dyn DiskWriterFactory,
        options: WriterOptions,
    ) -> Result<(), StorageError> {
        self.open_with(factory, options, OpenMode::Existing)
    }

    fn open_with(
        &mut self,
        factory: &dyn DiskWriterFactory,
        options: WriterOptions,
        mode: OpenMode,
    ) -> Result<(), StorageError> {
        match self.slot {
            WriterSlot::Inactive => return Err(StorageError::NotOpen(self.file_path.clone())),
            WriterSlot::Open(_) => self.close_file()?,
            WriterSlot::Closed => {}
        }

        let mut writer = factory.new_disk_writer(&self.file_path, options);
        match mode {
            OpenMode::CreateIfMissing => writer.open_file()?,
            OpenMode::Truncate => writer.init_and_open_file()?,
            OpenMode::Existing => writer.open_existing_file()?,
        }
        self.slot = WriterSlot::Open(writer);
        Ok(())
    }

    /// Closes the handle. The writer is dropped even when closing fails.
    pub(crate) fn close_file(&mut self) -> Result<(), StorageError> {
        match std::mem::replace(&mut self.slot, WriterSlot::Closed) {
            WriterSlot::Open(mut writer) => writer.close_file(),
            WriterSlot::Inactive => {
                self.slot = WriterSlot::Inactive;
                Ok(())
            }
            WriterSlot::Closed => Ok(()),
        }
    }

    /// The open writer, or `NotOpen` when the entry holds no handle.
    pub fn writer_mut(&mut self) -> Result<&mut (dyn DiskWriter + 'static), StorageError> {
        match &mut self.slot {
            WriterSlot::Open(writer) => Ok(writer.as_mut()),
            _ => Err(StorageError::NotOpen(self.file_path.clone())),
        }
    }

    /// On-disk size; the entry must be open.
    pub fn size(&mut self) -> Result<u64, StorageError> {
        self.writer_mut()?.size()
    }

    pub fn enable_direct_io(&mut self) {
        if let WriterSlot::Open(writer) = &mut self.slot {
            writer.enable_direct_io();
        }
    }

    pub fn disable_direct_io(&mut self) {
        if let WriterSlot::Open(writer) = &mut self.slot {
            writer.disable_direct_io();
        }
    }
}
