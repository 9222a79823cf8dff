//! The file handle primitive the adaptor drives.
//!
//! [`DiskWriter`] is the seam between the mapping layer and the operating
//! system. The adaptor never touches `std::fs::File` directly; it asks a
//! [`DiskWriterFactory`] for a writer bound to a path and calls through the
//! trait, so alternative backends (or failure-injecting test doubles) can be
//! plugged in with [`MultiDiskAdaptor::with_writer_factory`].
//!
//! [`MultiDiskAdaptor::with_writer_factory`]: super::MultiDiskAdaptor::with_writer_factory

use std::fs::{File, FileTimes, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::error::StorageError;

/// Settings applied to every writer the adaptor creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriterOptions {
    /// Open files without write access; writes fail with `ReadOnly`.
    pub read_only: bool,
    /// Permit `enable_direct_io` to bypass the page cache where supported.
    pub direct_io_allowed: bool,
}

/// An OS file handle bound to one path.
///
/// Offsets are file-local. A writer starts closed; every I/O method other
/// than the open family fails with [`StorageError::NotOpen`] until one of
/// them succeeds.
pub trait DiskWriter: Send {
    fn path(&self) -> &Path;

    /// Opens the file, creating it (and its parent directories) if missing.
    fn open_file(&mut self) -> Result<(), StorageError>;

    /// Creates the file or truncates an existing one to zero, then opens it.
    fn init_and_open_file(&mut self) -> Result<(), StorageError>;

    /// Opens the file only if it already exists.
    fn open_existing_file(&mut self) -> Result<(), StorageError>;

    fn close_file(&mut self) -> Result<(), StorageError>;

    fn is_open(&self) -> bool;

    /// Reads up to `buf.len()` bytes at `offset`, stopping early at end of
    /// file. Returns the number of bytes read.
    fn read_data(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError>;

    fn write_data(&mut self, data: &[u8], offset: u64) -> Result<(), StorageError>;

    fn size(&mut self) -> Result<u64, StorageError>;

    fn truncate(&mut self, length: u64) -> Result<(), StorageError>;

    /// Reserves `[offset, offset + length)` on disk. The default grows the
    /// file length without reserving blocks.
    fn allocate(&mut self, offset: u64, length: u64) -> Result<(), StorageError> {
        let target = offset + length;
        if self.size()? < target {
            self.truncate(target)?;
        }
        Ok(())
    }

    fn set_times(&mut self, accessed: SystemTime, modified: SystemTime)
        -> Result<(), StorageError>;

    /// Best effort; a writer that cannot bypass the page cache ignores it.
    fn enable_direct_io(&mut self) {}

    fn disable_direct_io(&mut self) {}
}

/// Creates writers for the adaptor's entries.
pub trait DiskWriterFactory: Send + Sync {
    fn new_disk_writer(&self, path: &Path, options: WriterOptions) -> Box<dyn DiskWriter>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDiskWriterFactory;

impl DiskWriterFactory for DefaultDiskWriterFactory {
    fn new_disk_writer(&self, path: &Path, options: WriterOptions) -> Box<dyn DiskWriter> {
        Box::new(DefaultDiskWriter::new(path.to_path_buf(), options))
    }
}

/// Sets access and modification times on the file at `path`.
pub fn set_file_times(
    path: &Path,
    accessed: SystemTime,
    modified: SystemTime,
) -> Result<(), StorageError> {
    let file = File::open(path).map_err(|e| StorageError::io(path, e))?;
    apply_times(&file, path, accessed, modified)
}

fn apply_times(
    file: &File,
    path: &Path,
    accessed: SystemTime,
    modified: SystemTime,
) -> Result<(), StorageError> {
    let times = FileTimes::new().set_accessed(accessed).set_modified(modified);
    file.set_times(times).map_err(|e| StorageError::io(path, e))
}

/// [`DiskWriter`] over a plain `std::fs::File`.
#[derive(Debug)]
pub struct DefaultDiskWriter {
    path: PathBuf,
    file: Option<File>,
    options: WriterOptions,
    // Written since open; close syncs so deferred write errors surface.
    dirty: bool,
    direct_io: bool,
}

impl DefaultDiskWriter {
    pub fn new(path: PathBuf, options: WriterOptions) -> Self {
        Self {
            path,
            file: None,
            options,
            dirty: false,
            direct_io: false,
        }
    }

    fn ensure_parent_dirs(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        Ok(())
    }

    fn open_with(&mut self, opts: &OpenOptions) -> Result<(), StorageError> {
        if self.file.is_some() {
            self.close_file()?;
        }
        let file = opts.open(&self.path).map_err(|e| self.err(e))?;
        self.file = Some(file);
        self.dirty = false;
        self.direct_io = false;
        tracing::trace!(path = %self.path.display(), "opened file");
        Ok(())
    }

    fn file_mut(&mut self) -> Result<&mut File, StorageError> {
        self.file
            .as_mut()
            .ok_or_else(|| StorageError::NotOpen(self.path.clone()))
    }

    fn writable(&self) -> Result<(), StorageError> {
        if self.options.read_only {
            return Err(StorageError::ReadOnly(self.path.clone()));
        }
        Ok(())
    }

    fn err(&self, source: std::io::Error) -> StorageError {
        StorageError::io(&self.path, source)
    }

    #[cfg(target_os = "linux")]
    fn set_direct_flag(&mut self, on: bool) -> std::io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let Some(file) = self.file.as_ref() else {
            return Ok(());
        };
        let fd = file.as_raw_fd();
        // SAFETY: `fd` is owned by `file`, which stays open for both calls.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let flags = if on {
            flags | libc::O_DIRECT
        } else {
            flags & !libc::O_DIRECT
        };
        // SAFETY: same descriptor; only the status flags are changed.
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn set_direct_flag(&mut self, _on: bool) -> std::io::Result<()> {
        Err(std::io::Error::new(
            ErrorKind::Unsupported,
            "direct I/O is not supported on this platform",
        ))
    }
}

impl DiskWriter for DefaultDiskWriter {
    fn path(&self) -> &Path {
        &self.path
    }

    fn open_file(&mut self) -> Result<(), StorageError> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        if !self.options.read_only {
            self.ensure_parent_dirs()?;
            opts.write(true).create(true).truncate(false);
        }
        self.open_with(&opts)
    }

    fn init_and_open_file(&mut self) -> Result<(), StorageError> {
        self.writable()?;
        self.ensure_parent_dirs()?;
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true).truncate(true);
        self.open_with(&opts)
    }

    fn open_existing_file(&mut self) -> Result<(), StorageError> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(!self.options.read_only);
        self.open_with(&opts)
    }

    fn close_file(&mut self) -> Result<(), StorageError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let dirty = std::mem::take(&mut self.dirty);
        self.direct_io = false;
        if dirty {
            file.sync_data().map_err(|e| self.err(e))?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn read_data(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        let path = self.path.clone();
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::io(&path, e))?;

        let mut read = 0;
        while read < buf.len() {
            match file.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(StorageError::io(&path, e)),
            }
        }
        Ok(read)
    }

    fn write_data(&mut self, data: &[u8], offset: u64) -> Result<(), StorageError> {
        self.writable()?;
        let path = self.path.clone();
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::io(&path, e))?;
        file.write_all(data).map_err(|e| StorageError::io(&path, e))?;
        self.dirty = true;
        Ok(())
    }

    fn size(&mut self) -> Result<u64, StorageError> {
        let path = self.path.clone();
        let file = self.file_mut()?;
        let metadata = file.metadata().map_err(|e| StorageError::io(&path, e))?;
        Ok(metadata.len())
    }

    fn truncate(&mut self, length: u64) -> Result<(), StorageError> {
        self.writable()?;
        let path = self.path.clone();
        let file = self.file_mut()?;
        file.set_len(length).map_err(|e| StorageError::io(&path, e))?;
        self.dirty = true;
        Ok(())
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    fn allocate(&mut self, offset: u64, length: u64) -> Result<(), StorageError> {
        use std::os::unix::io::AsRawFd;

        self.writable()?;
        let fd = self.file_mut()?.as_raw_fd();
        // SAFETY: `fd` belongs to the open file held in `self.file`.
        let r = unsafe { libc::posix_fallocate(fd, offset as libc::off_t, length as libc::off_t) };
        if r == 0 {
            self.dirty = true;
            return Ok(());
        }
        if r != libc::EOPNOTSUPP && r != libc::EINVAL {
            return Err(self.err(std::io::Error::from_raw_os_error(r)));
        }
        tracing::debug!(
            path = %self.path.display(),
            errno = r,
            "posix_fallocate unsupported, falling back to set_len"
        );
        let target = offset + length;
        if self.size()? < target {
            self.truncate(target)?;
        }
        Ok(())
    }

    fn set_times(
        &mut self,
        accessed: SystemTime,
        modified: SystemTime,
    ) -> Result<(), StorageError> {
        match self.file.as_ref() {
            Some(file) => apply_times(file, &self.path, accessed, modified),
            None => set_file_times(&self.path, accessed, modified),
        }
    }

    fn enable_direct_io(&mut self) {
        if !self.options.direct_io_allowed || self.direct_io || self.file.is_none() {
            return;
        }
        match self.set_direct_flag(true) {
            Ok(()) => self.direct_io = true,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "direct I/O unavailable")
            }
        }
    }

    fn disable_direct_io(&mut self) {
        if !self.direct_io {
            return;
        }
        if let Err(e) = self.set_direct_flag(false) {
            tracing::debug!(path = %self.path.display(), error = %e, "failed to clear direct I/O");
        }
        self.direct_io = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    fn writer(temp: &TempDir, name: &str, options: WriterOptions) -> DefaultDiskWriter {
        DefaultDiskWriter::new(temp.path().join(name), options)
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let mut w = writer(&temp, "nested/dir/file.dat", WriterOptions::default());
        w.open_file().unwrap();
        assert!(temp.path().join("nested/dir/file.dat").is_file());
        assert_eq!(w.size().unwrap(), 0);
    }

    #[test]
    fn test_write_read_and_short_read() {
        let temp = TempDir::new().unwrap();
        let mut w = writer(&temp, "f", WriterOptions::default());
        w.open_file().unwrap();
        w.write_data(b"hello", 2).unwrap();
        assert_eq!(w.size().unwrap(), 7);

        let mut buf = [0xffu8; 10];
        let n = w.read_data(&mut buf, 2).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(buf[5], 0xff);
        w.close_file().unwrap();
    }

    #[test]
    fn test_io_requires_open() {
        let temp = TempDir::new().unwrap();
        let mut w = writer(&temp, "f", WriterOptions::default());
        assert!(matches!(w.size(), Err(StorageError::NotOpen(_))));
        assert!(matches!(
            w.write_data(b"x", 0),
            Err(StorageError::NotOpen(_))
        ));
    }

    #[test]
    fn test_init_truncates_existing() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("f"), b"old contents").unwrap();
        let mut w = writer(&temp, "f", WriterOptions::default());
        w.init_and_open_file().unwrap();
        assert_eq!(w.size().unwrap(), 0);
    }

    #[test]
    fn test_open_existing_fails_when_missing() {
        let temp = TempDir::new().unwrap();
        let mut w = writer(&temp, "missing", WriterOptions::default());
        assert!(matches!(
            w.open_existing_file(),
            Err(StorageError::Io { .. })
        ));
        assert!(!temp.path().join("missing").exists());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("f"), b"abc").unwrap();
        let options = WriterOptions {
            read_only: true,
            ..Default::default()
        };
        let mut w = writer(&temp, "f", options);
        w.open_file().unwrap();
        assert!(matches!(
            w.write_data(b"x", 0),
            Err(StorageError::ReadOnly(_))
        ));
        assert!(matches!(w.truncate(0), Err(StorageError::ReadOnly(_))));
    }

    #[test]
    fn test_allocate_grows_file() {
        let temp = TempDir::new().unwrap();
        let mut w = writer(&temp, "f", WriterOptions::default());
        w.open_file().unwrap();
        w.allocate(0, 4096).unwrap();
        assert_eq!(w.size().unwrap(), 4096);
    }

    #[test]
    fn test_set_file_times() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f");
        std::fs::write(&path, b"").unwrap();
        let accessed = UNIX_EPOCH + Duration::from_secs(100_000);
        let modified = UNIX_EPOCH + Duration::from_secs(200_000);
        set_file_times(&path, accessed, modified).unwrap();
        let metadata = std::fs::metadata(&path).unwrap();
        assert_eq!(metadata.modified().unwrap(), modified);
    }

    #[test]
    fn test_direct_io_is_noop_when_not_allowed() {
        let temp = TempDir::new().unwrap();
        let mut w = writer(&temp, "f", WriterOptions::default());
        w.open_file().unwrap();
        w.enable_direct_io();
        w.write_data(b"unaligned", 3).unwrap();
        w.disable_direct_io();
    }
}
