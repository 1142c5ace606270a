//! The WAL engine.
//!
//! Public surface of the write-ahead log: open/close, the read/write
//! transaction state machine, frame lookup, page reads, and the append +
//! commit path. The engine supports the durability half of ACID: a
//! transaction's frames are appended under the exclusive lock, and the commit
//! frame publishes the index and syncs the file before the transaction ends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use luxdb_error::{LuxdbError, Result};
use luxdb_io::{random_i32, DbFile, OpenFlags, Page, PAGE_BYTES};

use crate::frame::{WalFrame, FRAME_BYTES, FRAME_HEADER_BYTES};
use crate::header::{WalHeader, WAL_HEADER_BYTES};
use crate::index::{WalIndex, WalLockKind};
use crate::index_header::WalIndexHeader;
use crate::iter::WalIterator;

/// The offset of the WAL header within the WAL file.
pub const WAL_HEADER_OFFSET: u64 = 0;

/// The one-shot lock serializing first-time WAL creation within a process.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// A write-ahead log with an off-heap, shared-memory index.
///
/// Clients enter a read transaction, optionally upgrade to a write
/// transaction, append pages with a final `commit = true`, and end the
/// transaction. Readers locate the frame of a page through the index and
/// read it from the WAL file, falling back to the main database when the
/// page is not in the log.
pub struct Wal {
    /// The WAL (`<db>-wal`) file.
    file: Arc<DbFile>,
    index: WalIndex,
    closed: bool,
}

impl Wal {
    /// Opens the WAL for the database at `database_path`, creating the WAL
    /// and index files on first use.
    ///
    /// A missing database file is created empty. A WAL for a non-empty
    /// database cannot be created yet: that requires the recovery path, and
    /// the open fails with a not-implemented error.
    pub fn open(database_path: &Path) -> Result<Self> {
        if !database_path.exists() {
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .open(database_path)?;
        }
        let db_path = std::fs::canonicalize(database_path)?;

        let wal_path = PathBuf::from(format!("{}-wal", db_path.display()));
        let index_path = PathBuf::from(format!("{}-shm", db_path.display()));

        // If the WAL exists there are a few scenarios: the database was
        // previously opened normally, another thread is currently creating a
        // new WAL, or the WAL is a stale leftover of a system failure. These
        // are hard to tell apart since each can be an intermediate state of
        // another, so the index is opened normally and only fails if it
        // detects that recovery is required.
        if wal_path.exists() {
            Self::open_existing(&wal_path, &index_path)
        } else {
            Self::open_new(&db_path, &wal_path, &index_path)
        }
    }

    fn open_existing(wal_path: &Path, index_path: &Path) -> Result<Self> {
        debug!(path = %wal_path.display(), "opening existing WAL");

        let wal = Arc::new(DbFile::open(wal_path, OpenFlags::READ_WRITE_CREATE)?);
        let shm = Arc::new(DbFile::open(index_path, OpenFlags::READ_WRITE_CREATE)?);
        let index = WalIndex::build_from_existing(&wal, shm)?;

        Ok(Self {
            file: wal,
            index,
            closed: false,
        })
    }

    fn open_new(db_path: &Path, wal_path: &Path, index_path: &Path) -> Result<Self> {
        debug!(path = %wal_path.display(), "opening new WAL");

        let Some(_init) = INIT_LOCK.try_lock() else {
            return Err(LuxdbError::InitLockBusy);
        };

        if std::fs::metadata(db_path)?.len() != 0 {
            // A WAL for a database that already has content requires the
            // recovery path.
            return Err(LuxdbError::not_implemented(
                "creating a WAL for a non-empty database",
            ));
        }

        // Create-exclusive, so a concurrent creator that won the race is
        // reported by the filesystem.
        let wal = Arc::new(DbFile::open(wal_path, OpenFlags::READ_WRITE_CREATE_NEW)?);
        let shm = Arc::new(DbFile::open(index_path, OpenFlags::READ_WRITE_CREATE_NEW)?);

        Self::write_header_and_index(&wal, shm)
    }

    /// Writes a fresh WAL header and builds the initial index from its
    /// salts. Both files must still be empty under the creation locks.
    fn write_header_and_index(wal: &Arc<DbFile>, shm: Arc<DbFile>) -> Result<Wal> {
        let shared = shm.try_file_lock(0, 1, true)?;
        let exclusive = shm.try_file_lock(2, 1, false)?;
        if shared.is_none() || exclusive.is_none() {
            return Err(LuxdbError::lock_failed(
                "cannot create new WAL: error obtaining initializer locks",
            ));
        }

        if wal.size()? != 0 || shm.size()? != 0 {
            return Err(LuxdbError::corrupt_wal("cannot create new WAL: it is not empty"));
        }

        let header = WalHeader::new(0, 0, random_i32(), random_i32())?;
        if wal.write(&header.to_bytes(), WAL_HEADER_OFFSET)? != WAL_HEADER_BYTES {
            return Err(LuxdbError::corrupt_wal(
                "cannot create new WAL: could not write initial WAL header",
            ));
        }
        wal.sync()?;

        let index = WalIndex::build_initial(
            header.db_size(),
            header.random_salt(),
            header.sequential_salt(),
            shm,
        )?;

        Ok(Wal {
            file: Arc::clone(wal),
            index,
            closed: false,
        })
    }

    /// Re-reads and validates the WAL header from disk.
    pub fn header(&self) -> Result<WalHeader> {
        WalHeader::read_from(&self.file, WAL_HEADER_OFFSET)
    }

    /// The current snapshot of the shared-memory index header.
    #[must_use]
    pub fn index_header(&self) -> &WalIndexHeader {
        self.index.header()
    }

    /// An ordered, sized iterator over the committed frames of this WAL.
    pub fn frames(&self) -> Result<WalIterator> {
        WalIterator::new(self.index.header(), Arc::clone(&self.file))
    }

    /// Enters a read transaction: refreshes a stale index snapshot and takes
    /// the shared lock.
    pub fn begin_read_transaction(&mut self) -> Result<()> {
        if self.index.is_stale()? {
            self.index.reload()?;
        }
        self.index.lock(WalLockKind::Shared)
    }

    /// Ends a read transaction, releasing all held locks.
    pub fn end_read_transaction(&mut self) {
        self.index.unlock();
    }

    /// Returns the frame slot the page currently lives in, or `-1` if the
    /// page is not in the WAL and must be read from the main database.
    #[must_use]
    pub fn frame_index_of(&self, page_index: i64) -> i32 {
        self.index.find_frame_index_of(page_index)
    }

    /// Reads the page image stored at `frame_index`.
    ///
    /// Requires at least the shared lock (logged otherwise). Fails with
    /// *no-such-page* past the last commit frame and *corrupt-page* when the
    /// image cannot be read in full.
    pub fn page_at(&self, frame_index: i32) -> Result<Vec<u8>> {
        if frame_index < 0 {
            return Err(LuxdbError::OutOfRange {
                what: "frame index",
                value: i64::from(frame_index),
            });
        }

        let lock = self.index.current_lock();
        if lock.mask() < WalLockKind::Shared.mask() {
            warn!(?lock, "reading WAL frame with unexpected lock kind");
        }

        // Bounds from the point of view of the calling thread's snapshot.
        if frame_index > self.index.header().last_commit_frame() {
            return Err(LuxdbError::NoSuchPage { frame: frame_index });
        }

        // The offset skips over the frame header, straight to the page image.
        let offset = WAL_HEADER_BYTES as u64
            + u64::try_from(frame_index).expect("frame index is non-negative") * FRAME_BYTES as u64
            + FRAME_HEADER_BYTES as u64;

        let mut page = vec![0_u8; PAGE_BYTES];
        let bytes_read = self.file.read(&mut page, offset)?;
        if bytes_read != PAGE_BYTES {
            return Err(LuxdbError::corrupt_page(format!(
                "could only read {bytes_read}/{PAGE_BYTES} bytes of page at WAL frame {frame_index}"
            )));
        }
        Ok(page)
    }

    /// Upgrades to a write transaction: takes the exclusive lock on top of
    /// the shared lock and verifies the snapshot is still current.
    ///
    /// Fails with *out-of-order-lock* when no read transaction is active and
    /// with *stale-WAL* when another writer committed since the read
    /// transaction began; in the latter case all locks are released so the
    /// caller can retry from [`Wal::begin_read_transaction`].
    pub fn begin_write_transaction(&mut self) -> Result<()> {
        self.index.lock(WalLockKind::Exclusive)?;

        match self.index.is_stale() {
            Ok(false) => Ok(()),
            Ok(true) => {
                self.index.unlock();
                Err(LuxdbError::StaleWal)
            }
            Err(e) => {
                self.index.unlock();
                Err(e)
            }
        }
    }

    /// Ends a write transaction, releasing all held locks.
    pub fn end_write_transaction(&mut self) {
        self.index.unlock();
    }

    /// Appends `page` to the WAL. With `commit`, the frame completes the
    /// transaction: the index is published, the WAL header is rewritten with
    /// the new database size, and the file is synced durable.
    ///
    /// The frame table and both header copies are only ever mutated under
    /// the exclusive lock, so appending outside a write transaction fails
    /// with *out-of-order-lock*. Transient failures are reported as
    /// [`LuxdbError::WriteTransient`] and may be retried; fatal ones as
    /// [`LuxdbError::WriteFatal`].
    pub fn write_page(&mut self, page: &Page, commit: bool) -> Result<()> {
        if self.closed {
            return Err(LuxdbError::write_fatal("WAL is closed"));
        }

        if self.index.current_lock() != WalLockKind::Exclusive {
            return Err(LuxdbError::OutOfOrderLock);
        }

        self.append_frame(page, commit).map_err(classify_write_error)
    }

    fn append_frame(&mut self, page: &Page, commit: bool) -> Result<()> {
        let header = self.index.header().clone();
        let frame = WalFrame::build(
            page.index(),
            commit,
            header.random_salt(),
            header.sequential_salt(),
            page.data(),
            header.cumulative_checksum(),
        )?;

        let cursor = header.cursor();
        let offset =
            WAL_HEADER_BYTES as u64 + u64::try_from(cursor).expect("cursor is non-negative") * FRAME_BYTES as u64;

        trace!(frame = cursor, page = page.index(), commit, "writing WAL frame");
        self.file.write(&frame.header_bytes(), offset)?;
        self.file.write(frame.page(), offset + FRAME_HEADER_BYTES as u64)?;

        // Update the index so the written page becomes locatable once the
        // commit publishes it.
        self.index.notify_appended(&frame, cursor)?;

        if frame.is_commit() {
            let disk_header = self.header()?;
            let updated = disk_header.with_db_size(self.index.header().db_size())?;
            self.file.write(&updated.to_bytes(), WAL_HEADER_OFFSET)?;

            self.index.publish();
            self.file.sync()?;
        }

        Ok(())
    }

    /// Closes the index and the WAL file. Idempotent; operations after close
    /// fail.
    pub fn close(&mut self) {
        if !self.closed {
            self.index.close();
            self.file.close();
            self.closed = true;
        }
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.file.path())
            .field("closed", &self.closed)
            .finish()
    }
}

/// Translates internal errors into the write-path taxonomy so callers can
/// drive retry loops without inspecting the cause.
fn classify_write_error(e: LuxdbError) -> LuxdbError {
    match e {
        // Interrupts invalidate the handle; surfaced as-is, non-retryable.
        LuxdbError::ClosedByInterrupt { .. } => e,
        // Another thread closed the shared handle; retryable with a fresh
        // handle, so not escalated to fatal.
        LuxdbError::FileClosed { path } => LuxdbError::write_transient(format!(
            "WAL closed by another thread ('{}'); give each thread its own handle",
            path.display()
        )),
        LuxdbError::CorruptWal { detail } => LuxdbError::write_fatal(format!(
            "WAL is corrupt, therefore not appending page: {detail}"
        )),
        LuxdbError::Io(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            LuxdbError::write_fatal(format!("WAL not opened for writing: {err}"))
        }
        LuxdbError::Io(err) => {
            LuxdbError::write_transient(format!("could not write to the WAL: {err}"))
        }
        // Typed domain errors (recursive-grow, overflow, range checks) keep
        // their own channel.
        other => other,
    }
}
