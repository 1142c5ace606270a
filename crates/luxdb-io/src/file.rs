//! The file façade used for database, WAL, and WAL-index files.
//!
//! A [`DbFile`] exposes three disjoint locking planes, because each targets a
//! distinct contention class:
//!
//! 1. an in-process reader/writer mutex ([`DbFile::mutex`]),
//! 2. an in-process exclusive mutex ([`DbFile::exclusive_mutex`]),
//! 3. cross-process advisory byte-range locks ([`DbFile::file_lock`]).
//!
//! The in-process mutexes are delegated to the file's [`FileSerial`], so all
//! handles to the same filesystem object share them even when opened through
//! different paths.
//!
//! Blocking operations may be interrupted. An interrupted read, write, or
//! lock invalidates the handle: further operations fail until
//! [`DbFile::reopen`] re-establishes the descriptor.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use luxdb_error::{LuxdbError, Result};

use crate::serial::{FileSerial, SerialRegistry};
use crate::shm::SharedSegment;

/// Options specifying how a [`DbFile`] is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    read: bool,
    write: bool,
    create: bool,
    create_new: bool,
}

impl OpenFlags {
    /// Open for reading and writing; the file must exist.
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
        create: false,
        create_new: false,
    };

    /// Open for reading and writing, creating the file if it is absent.
    pub const READ_WRITE_CREATE: Self = Self {
        read: true,
        write: true,
        create: true,
        create_new: false,
    };

    /// Create a brand-new file for reading and writing; fails if the file
    /// already exists.
    pub const READ_WRITE_CREATE_NEW: Self = Self {
        read: true,
        write: true,
        create: false,
        create_new: true,
    };

    fn open_options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options
            .read(self.read)
            .write(self.write)
            .create(self.create)
            .create_new(self.create_new);
        options
    }

    /// The flags to use when re-establishing a closed descriptor. A
    /// create-exclusive open must not fail because the file it created still
    /// exists.
    const fn for_reopen(mut self) -> Self {
        self.create_new = false;
        self
    }
}

/// Attempt a POSIX advisory lock via `fcntl`.
///
/// With `blocking`, uses `F_SETLKW` and waits for the region to free up;
/// otherwise uses `F_SETLK`. Returns `Ok(true)` if the lock was acquired,
/// `Ok(false)` if it would block, and `Err` for real I/O errors (including
/// `EINTR` from an interrupted blocking acquisition).
fn fcntl_lock(file: &File, lock_type: i32, start: u64, len: u64, blocking: bool) -> Result<bool> {
    let lock_type = i16::try_from(lock_type).expect("fcntl lock type must fit in i16");
    let whence = i16::try_from(libc::SEEK_SET).expect("SEEK_SET must fit in i16");
    #[allow(clippy::cast_possible_wrap)]
    let flock = libc::flock {
        l_type: lock_type,
        l_whence: whence,
        l_start: start as libc::off_t,
        l_len: len as libc::off_t,
        l_pid: 0,
    };

    let arg = if blocking {
        nix::fcntl::FcntlArg::F_SETLKW(&flock)
    } else {
        nix::fcntl::FcntlArg::F_SETLK(&flock)
    };

    match nix::fcntl::fcntl(file.as_fd().as_raw_fd(), arg) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EACCES | nix::errno::Errno::EAGAIN) => Ok(false),
        Err(e) => Err(LuxdbError::Io(e.into())),
    }
}

/// Release a POSIX advisory lock.
fn fcntl_unlock(file: &File, start: u64, len: u64) -> Result<()> {
    let ok = fcntl_lock(file, libc::F_UNLCK, start, len, false)?;
    debug_assert!(ok, "F_UNLCK should never fail with EAGAIN");
    Ok(())
}

/// An advisory byte-range lock on a [`DbFile`].
///
/// The lock is released when this value is dropped. Because POSIX locks are
/// per-process, the OS-level lock is shared by every in-process holder of the
/// same slot and is only released when the last holder drops; the refcounts
/// live on the file's [`FileSerial`].
pub struct FileRangeLock {
    file: Arc<File>,
    serial: Arc<FileSerial>,
    offset: u64,
    len: u64,
    shared: bool,
}

impl FileRangeLock {
    /// The byte offset of the locked region.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The length of the locked region.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether this is a shared (read) lock.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.shared
    }
}

impl Drop for FileRangeLock {
    fn drop(&mut self) {
        let mut slots = self.serial.range_locks().lock();
        let Some(state) = slots.get_mut(&self.offset) else {
            return;
        };

        if self.shared {
            state.shared = state.shared.saturating_sub(1);
        } else {
            state.exclusive = state.exclusive.saturating_sub(1);
        }

        if state.shared == 0 && state.exclusive == 0 {
            slots.remove(&self.offset);
            if let Err(e) = fcntl_unlock(&self.file, self.offset, self.len) {
                warn!(
                    offset = self.offset,
                    len = self.len,
                    error = %e,
                    "could not release file range lock, but must proceed as if it were released"
                );
            }
        }
    }
}

impl std::fmt::Debug for FileRangeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRangeLock")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// A handle on a database, WAL, or WAL-index file.
///
/// Although a `DbFile` tolerates concurrent use, every thread is expected to
/// open its own handle; the shared [`FileSerial`] keeps the synchronization
/// objects common across all of them.
pub struct DbFile {
    /// The real, absolute path to the file.
    path: PathBuf,
    /// The options the file was opened with, reused by [`DbFile::reopen`].
    flags: OpenFlags,
    /// The unique serial of this file.
    serial: Arc<FileSerial>,
    /// The descriptor, replaceable by [`DbFile::reopen`].
    handle: RwLock<Arc<File>>,
    open: AtomicBool,
}

impl DbFile {
    /// Opens a `DbFile` at `path` with the given options.
    ///
    /// The path is canonicalized after the open so that relative and indirect
    /// paths to the same file resolve to the same [`FileSerial`].
    pub fn open(path: &Path, flags: OpenFlags) -> Result<Self> {
        let file = flags.open_options().open(path)?;
        let real_path = std::fs::canonicalize(path)?;
        let serial = SerialRegistry::global().find(&real_path)?;

        debug!(path = %real_path.display(), ?flags, "opened file");

        Ok(Self {
            path: real_path,
            flags,
            serial,
            handle: RwLock::new(Arc::new(file)),
            open: AtomicBool::new(true),
        })
    }

    /// The real, absolute path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this handle is usable. A handle invalidated by an interrupt or
    /// closed by [`DbFile::close`] must be [reopened](Self::reopen) first.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Re-establishes the descriptor if the handle was invalidated. If the
    /// handle is open, this has no effect.
    pub fn reopen(&self) -> Result<()> {
        if !self.is_open() {
            debug!(path = %self.path.display(), "attempting to reopen file");
            let file = self.flags.for_reopen().open_options().open(&self.path)?;
            *self.handle.write() = Arc::new(file);
            self.open.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Marks this handle closed. Further operations fail until
    /// [`DbFile::reopen`] is called.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// The current file size in bytes.
    pub fn size(&self) -> Result<u64> {
        let file = self.descriptor()?;
        Ok(file.metadata()?.len())
    }

    /// Reads up to `dst.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes actually read, which is smaller than the
    /// buffer when end-of-file is reached. Callers validate short reads.
    pub fn read(&self, dst: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.descriptor()?;
        let mut total = 0_usize;
        while total < dst.len() {
            let off = offset + total as u64;
            match file.read_at(&mut dst[total..], off) {
                Ok(0) => break, // EOF
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    return Err(self.invalidate());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Writes all of `src` starting at `offset`, returning the number of
    /// bytes written.
    pub fn write(&self, src: &[u8], offset: u64) -> Result<usize> {
        let file = self.descriptor()?;
        let mut total = 0_usize;
        while total < src.len() {
            let off = offset + total as u64;
            match file.write_at(&src[total..], off) {
                Ok(0) => {
                    return Err(LuxdbError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write_at returned 0",
                    )));
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    return Err(self.invalidate());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Forces any updates to this file to be written to the storage device
    /// that contains it.
    pub fn sync(&self) -> Result<()> {
        let file = self.descriptor()?;
        file.sync_data()?;
        Ok(())
    }

    /// Maps `len` bytes at `offset` for reading and writing, shared with
    /// every process that maps the same region of the same file. The file is
    /// extended if it is shorter than `offset + len`.
    pub fn map_shared(&self, offset: u64, len: usize) -> Result<SharedSegment> {
        let file = self.descriptor()?;
        let end = offset + len as u64;
        if file.metadata()?.len() < end {
            file.set_len(end)?;
        }
        SharedSegment::map(&file, offset, len)
    }

    /// The in-process reader/writer mutex shared by all handles to this file.
    #[must_use]
    pub fn mutex(&self) -> Arc<RwLock<()>> {
        self.serial.mutex()
    }

    /// The in-process exclusive mutex shared by all handles to this file.
    #[must_use]
    pub fn exclusive_mutex(&self) -> Arc<Mutex<()>> {
        self.serial.exclusive_mutex()
    }

    /// The unique serial of this file.
    #[must_use]
    pub fn serial(&self) -> &Arc<FileSerial> {
        &self.serial
    }

    /// Acquires an advisory lock on the given byte range, blocking until the
    /// region is free. `shared` selects a read lock, otherwise a write lock.
    ///
    /// An interrupted acquisition invalidates the handle and fails with
    /// [`LuxdbError::ClosedByInterrupt`].
    pub fn file_lock(&self, offset: u64, len: u64, shared: bool) -> Result<FileRangeLock> {
        match self.lock_range(offset, len, shared, true)? {
            Some(lock) => Ok(lock),
            None => Err(LuxdbError::lock_failed(
                "blocking byte-range lock reported contention",
            )),
        }
    }

    /// Attempts to acquire an advisory lock on the given byte range without
    /// blocking. Returns `None` if another process holds an overlapping lock.
    pub fn try_file_lock(&self, offset: u64, len: u64, shared: bool) -> Result<Option<FileRangeLock>> {
        self.lock_range(offset, len, shared, false)
    }

    /// The shared lock/try-lock path: the OS-level lock is only requested by
    /// the first in-process holder of the slot; later holders bump the
    /// refcount on the file's serial.
    fn lock_range(
        &self,
        offset: u64,
        len: u64,
        shared: bool,
        blocking: bool,
    ) -> Result<Option<FileRangeLock>> {
        let file = self.descriptor()?;
        let mut slots = self.serial.range_locks().lock();

        let already_held = {
            let state = slots.entry(offset).or_default();
            if shared {
                state.shared > 0
            } else {
                state.exclusive > 0
            }
        };
        if !already_held {
            let lock_type = if shared { libc::F_RDLCK } else { libc::F_WRLCK };
            let acquired = fcntl_lock(&file, lock_type, offset, len, blocking);
            if !matches!(acquired, Ok(true)) {
                if slots
                    .get(&offset)
                    .is_some_and(|state| state.shared == 0 && state.exclusive == 0)
                {
                    slots.remove(&offset);
                }
                return match acquired {
                    Ok(_) => Ok(None),
                    Err(LuxdbError::Io(e)) if e.kind() == io::ErrorKind::Interrupted => {
                        drop(slots);
                        Err(self.invalidate())
                    }
                    Err(e) => Err(e),
                };
            }
        }

        let state = slots.entry(offset).or_default();
        if shared {
            state.shared += 1;
        } else {
            state.exclusive += 1;
        }

        Ok(Some(FileRangeLock {
            file,
            serial: Arc::clone(&self.serial),
            offset,
            len,
            shared,
        }))
    }

    /// Returns the current descriptor, or fails if the handle is closed.
    fn descriptor(&self) -> Result<Arc<File>> {
        if !self.is_open() {
            return Err(LuxdbError::FileClosed {
                path: self.path.clone(),
            });
        }
        Ok(Arc::clone(&self.handle.read()))
    }

    /// Marks the handle closed after an interrupted blocking operation.
    fn invalidate(&self) -> LuxdbError {
        self.open.store(false, Ordering::SeqCst);
        LuxdbError::ClosedByInterrupt {
            path: self.path.clone(),
        }
    }
}

impl Drop for DbFile {
    fn drop(&mut self) {
        SerialRegistry::global().release(&self.serial);
    }
}

impl std::fmt::Debug for DbFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbFile")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish()
    }
}
