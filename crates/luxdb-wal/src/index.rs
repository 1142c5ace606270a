//! The shared-memory WAL index.
//!
//! Composes the duplicated [`WalIndexHeader`] copies and the [`FrameTable`]
//! over one shared-memory segment of the `<db>-shm` file, and owns the
//! multi-level lock protocol coordinating readers, writers, and checkpoint
//! operations across threads and processes:
//!
//! - the in-process reader/writer mutex and exclusive mutex come from the
//!   index file's serial, so every handle to the same file shares them;
//! - cross-process coordination uses advisory byte-range locks on the index
//!   file at offset 0 (shared slot) and offset 2 (exclusive slot).
//!
//! A shared lock must precede any exclusive request; this prevents a
//! checkpoint racing a writer that has not yet observed the current snapshot.
//! Acquisition order is in-process mutex first, then the byte-range lock;
//! release is the reverse, exclusive before shared.

use std::sync::Arc;

use parking_lot::lock_api::{ArcMutexGuard, ArcRwLockReadGuard};
use parking_lot::{RawMutex, RawRwLock};
use tracing::{trace, warn};

use luxdb_error::{LuxdbError, Result};
use luxdb_io::{DbFile, FileRangeLock, SharedSegment};

use crate::frame::WalFrame;
use crate::header::WalHeader;
use crate::index_header::{WalIndexHeader, INDEX_HEADER_BYTES};
use crate::index_table::FrameTable;
use crate::iter::WalIterator;

/// The number of index-header copies. Two copies make concurrent
/// modification detectable.
const INDEX_HEADER_COPIES: usize = 2;

/// One lock byte per lock slot; the WAL uses two, the rest are reserved.
const LOCK_BYTE_COUNT: usize = 8;

/// The mapped region holding both header copies and the lock bytes.
const HEADERS_REGION_BYTES: usize = INDEX_HEADER_COPIES * INDEX_HEADER_BYTES + LOCK_BYTE_COUNT;

/// The file offset of the frame table header within the index file.
const TABLE_HEADER_FILE_OFFSET: u64 = HEADERS_REGION_BYTES as u64;

/// The byte-range lock slot taken by readers.
const SHARED_SLOT_OFFSET: u64 = 0;

/// The byte-range lock slot taken by writers.
const EXCLUSIVE_SLOT_OFFSET: u64 = 2;

type SharedMutexGuard = ArcRwLockReadGuard<RawRwLock, ()>;
type ExclusiveMutexGuard = ArcMutexGuard<RawMutex, ()>;

/// The lock levels of the WAL index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalLockKind {
    /// No lock is held.
    None,
    /// Readers hold this; it also blocks checkpoints.
    Shared,
    /// Writers hold this in addition to the shared lock.
    Exclusive,
}

impl WalLockKind {
    /// The bit this lock kind occupies in the held-locks mask.
    #[must_use]
    pub const fn mask(self) -> u8 {
        match self {
            Self::None => 0x01,
            Self::Shared => 0x02,
            Self::Exclusive => 0x04,
        }
    }
}

/// The WAL index, mapped into shared memory.
pub struct WalIndex {
    /// The index (`<db>-shm`) file.
    file: Arc<DbFile>,
    /// The mapped region holding both header copies and the lock bytes.
    headers_seg: SharedSegment,
    /// On-heap mirrors of the two header copies.
    headers: [WalIndexHeader; INDEX_HEADER_COPIES],
    /// The frame→page table.
    table: FrameTable,
    /// Bitmask of the lock kinds currently held.
    locks: u8,
    /// Held byte-range locks, one per slot.
    shared_range: Option<FileRangeLock>,
    exclusive_range: Option<FileRangeLock>,
    /// Held in-process guards.
    shared_guard: Option<SharedMutexGuard>,
    exclusive_guard: Option<ExclusiveMutexGuard>,
}

impl WalIndex {
    fn attach(file: Arc<DbFile>, headers_seg: SharedSegment, headers: [WalIndexHeader; 2]) -> Result<Self> {
        let table = FrameTable::attach(Arc::clone(&file), TABLE_HEADER_FILE_OFFSET)?;
        Ok(Self {
            file,
            headers_seg,
            headers,
            table,
            locks: WalLockKind::None.mask(),
            shared_range: None,
            exclusive_range: None,
            shared_guard: None,
            exclusive_guard: None,
        })
    }

    /// Builds the index of a brand-new WAL: the segment is zero-filled and
    /// both header copies start out empty with the given salts.
    pub fn build_initial(
        db_size: i64,
        random_salt: i32,
        sequential_salt: i32,
        shm: Arc<DbFile>,
    ) -> Result<Self> {
        if db_size < 0 {
            return Err(LuxdbError::OutOfRange {
                what: "database size",
                value: db_size,
            });
        }

        let mut segment = shm.map_shared(0, HEADERS_REGION_BYTES)?;
        segment.fill(0);

        let header = WalIndexHeader::initial(db_size, random_salt, sequential_salt);
        header.store_to(&mut segment, 0);
        header.store_to(&mut segment, INDEX_HEADER_BYTES);

        Self::attach(shm, segment, [header.clone(), header])
    }

    /// Attaches to the index of an existing WAL. If the mapped index is
    /// empty, the frame→page mappings are reconstructed by iterating the WAL
    /// itself under an opportunistic exclusive lock.
    pub fn build_from_existing(wal: &Arc<DbFile>, shm: Arc<DbFile>) -> Result<Self> {
        let segment = shm.map_shared(0, HEADERS_REGION_BYTES)?;
        let headers = load_headers(&segment);
        if headers[0] != headers[1] {
            return Err(LuxdbError::concurrent_modification(
                "cannot attach WAL index: concurrent modification detected",
            ));
        }

        let mut index = Self::attach(shm, segment, headers)?;

        // An empty or never-written mapped header means the WAL was not
        // mapped before; fill the index by iterating the WAL. Skipped when
        // another thread or process holds a conflicting lock; it either
        // rebuilds the index itself or has it already.
        let unmapped = index.headers[0].is_empty() || index.headers[0].is_unmapped();
        if unmapped && index.try_lock_exclusive_ordered()? {
            let rebuilt = index.rebuild_from(wal);
            index.unlock();
            rebuilt?;
        }

        Ok(index)
    }

    /// Reconstructs the index from the WAL file. Requires the exclusive lock.
    fn rebuild_from(&mut self, wal: &Arc<DbFile>) -> Result<()> {
        if self.is_stale()? {
            return Err(LuxdbError::concurrent_modification(
                "WAL contents changed between empty-check and obtaining an exclusive lock",
            ));
        }

        let wal_header = WalHeader::read_from(wal, 0)?;

        // A never-written segment reads as all zeros; seed the mirrors with
        // the WAL header's salts and the empty hash state before replaying,
        // or frames appended later would carry zero salts.
        if self.headers[0].is_unmapped() {
            let seeded =
                WalIndexHeader::initial(0, wal_header.random_salt(), wal_header.sequential_salt());
            self.headers = [seeded.clone(), seeded];
        }

        let frames = WalIterator::new(&self.headers[0], Arc::clone(wal))?;
        for frame in frames {
            let frame = frame?;
            // Frames from a previous checkpoint epoch carry stale salts and
            // must not enter the index.
            if frame.random_salt() == wal_header.random_salt()
                && frame.sequential_salt() == wal_header.sequential_salt()
            {
                let frame_index = self.headers[0].cursor();
                self.notify_appended(&frame, frame_index)?;
            }
        }

        self.publish();
        Ok(())
    }

    /// The current snapshot of the index header.
    #[must_use]
    pub fn header(&self) -> &WalIndexHeader {
        &self.headers[0]
    }

    /// Whether the shared-memory index has changed relative to this
    /// instance's snapshot.
    ///
    /// Fails with a concurrent-modification error when the two mapped copies
    /// differ, meaning a writer is mid-update; the caller retries.
    pub fn is_stale(&self) -> Result<bool> {
        let shm_headers = load_headers(&self.headers_seg);
        if shm_headers[0] == shm_headers[1] {
            Ok(self.headers[0] != shm_headers[0])
        } else {
            Err(LuxdbError::concurrent_modification(
                "cannot verify WAL index changes: concurrent modification detected",
            ))
        }
    }

    /// Replaces this instance's snapshot with the current shared-memory
    /// state and re-derives the table mapping.
    pub fn reload(&mut self) -> Result<()> {
        let shm_headers = load_headers(&self.headers_seg);
        if shm_headers[0] == shm_headers[1] {
            self.headers = shm_headers;
            self.table.reload()
        } else {
            Err(LuxdbError::concurrent_modification(
                "cannot reload WAL index: concurrent modification detected",
            ))
        }
    }

    /// Returns the frame slot the page currently lives in, or `-1`.
    /// Requires at least the shared lock.
    #[must_use]
    pub fn find_frame_index_of(&self, page_index: i64) -> i32 {
        self.table.key_of(page_index)
    }

    /// Accounts for a frame appended at `frame_index` in both header mirrors
    /// and the frame→page table. Requires the exclusive lock.
    pub fn notify_appended(&mut self, frame: &WalFrame, frame_index: i32) -> Result<()> {
        // The table insert comes first: the header mirrors may only advance
        // past frames that actually entered the table, or a failed grow
        // would leave the cursor pointing beyond an unindexed frame.
        self.table.put(frame_index, frame.page_index())?;
        self.headers[0].notify_appended(frame, frame_index);
        self.headers[1].notify_appended(frame, frame_index);
        Ok(())
    }

    /// Writes both header mirrors back to the mapped segment, first copy
    /// first, so a concurrent reader observes either the old pair, the new
    /// pair, or a detectable mismatch.
    pub fn publish(&mut self) {
        if self.current_lock() != WalLockKind::Exclusive {
            warn!("publishing WAL index headers without an exclusive lock");
        }

        self.headers[0].store_to(&mut self.headers_seg, 0);
        self.headers[1].store_to(&mut self.headers_seg, INDEX_HEADER_BYTES);
    }

    /// The most restrictive lock kind currently held.
    #[must_use]
    pub fn current_lock(&self) -> WalLockKind {
        if self.has_lock(WalLockKind::Exclusive) {
            WalLockKind::Exclusive
        } else if self.has_lock(WalLockKind::Shared) {
            WalLockKind::Shared
        } else {
            WalLockKind::None
        }
    }

    fn has_lock(&self, kind: WalLockKind) -> bool {
        self.locks & kind.mask() == kind.mask()
    }

    fn locked_less_restrictive_than(&self, kind: WalLockKind) -> bool {
        self.locks < kind.mask()
    }

    /// Acquires a lock of the given kind, blocking as needed. Requesting a
    /// kind at or below the current level is a no-op.
    pub fn lock(&mut self, kind: WalLockKind) -> Result<()> {
        if self.locked_less_restrictive_than(kind) {
            match kind {
                WalLockKind::Shared => self.lock_shared()?,
                WalLockKind::Exclusive => self.lock_exclusive()?,
                WalLockKind::None => {}
            }
        }
        Ok(())
    }

    /// Attempts to acquire a lock of the given kind without blocking.
    /// Returns whether the requested level is now held.
    pub fn try_lock(&mut self, kind: WalLockKind) -> Result<bool> {
        if self.locked_less_restrictive_than(kind) {
            return match kind {
                WalLockKind::Shared => Ok(self.try_lock_shared()),
                WalLockKind::Exclusive => self.try_lock_exclusive(),
                WalLockKind::None => Ok(true),
            };
        }
        Ok(true)
    }

    /// Releases every held lock, exclusive before shared.
    pub fn unlock(&mut self) {
        if self.locks != WalLockKind::None.mask() {
            self.unlock_exclusive();
            self.unlock_shared();
        }
    }

    fn lock_shared(&mut self) -> Result<()> {
        let guard = self.file.mutex().read_arc();
        match self.file.file_lock(SHARED_SLOT_OFFSET, 1, true) {
            Ok(range) => {
                self.shared_guard = Some(guard);
                self.shared_range = Some(range);
                self.locks |= WalLockKind::Shared.mask();
                Ok(())
            }
            Err(e @ LuxdbError::ClosedByInterrupt { .. }) => Err(e),
            Err(e) => Err(LuxdbError::lock_failed(format!(
                "cannot obtain shared lock on WAL index file: {e}"
            ))),
        }
    }

    fn try_lock_shared(&mut self) -> bool {
        let Some(guard) = self.file.mutex().try_read_arc() else {
            return false;
        };

        match self.file.try_file_lock(SHARED_SLOT_OFFSET, 1, true) {
            Ok(Some(range)) => {
                self.shared_guard = Some(guard);
                self.shared_range = Some(range);
                self.locks |= WalLockKind::Shared.mask();
                true
            }
            Ok(None) => false,
            Err(e) => {
                trace!(error = %e, "I/O error while trying to obtain a shared lock");
                false
            }
        }
    }

    fn lock_exclusive(&mut self) -> Result<()> {
        // An exclusive lock requires the shared lock: rows are read before
        // they are updated, and the shared lock is what keeps a checkpoint
        // from running concurrently.
        if !self.has_lock(WalLockKind::Shared) {
            return Err(LuxdbError::OutOfOrderLock);
        }

        let guard = self.file.exclusive_mutex().lock_arc();
        match self.file.file_lock(EXCLUSIVE_SLOT_OFFSET, 1, false) {
            Ok(range) => {
                self.exclusive_guard = Some(guard);
                self.exclusive_range = Some(range);
                self.locks |= WalLockKind::Exclusive.mask();
                Ok(())
            }
            Err(e @ LuxdbError::ClosedByInterrupt { .. }) => Err(e),
            Err(e) => Err(LuxdbError::lock_failed(format!(
                "cannot obtain exclusive lock on WAL index file: {e}"
            ))),
        }
    }

    fn try_lock_exclusive(&mut self) -> Result<bool> {
        if !self.has_lock(WalLockKind::Shared) {
            return Err(LuxdbError::OutOfOrderLock);
        }

        let Some(guard) = self.file.exclusive_mutex().try_lock_arc() else {
            return Ok(false);
        };

        match self.file.try_file_lock(EXCLUSIVE_SLOT_OFFSET, 1, false) {
            Ok(Some(range)) => {
                self.exclusive_guard = Some(guard);
                self.exclusive_range = Some(range);
                self.locks |= WalLockKind::Exclusive.mask();
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                trace!(error = %e, "I/O error while trying to obtain an exclusive lock");
                Ok(false)
            }
        }
    }

    /// Takes the ordered shared-then-exclusive pair opportunistically,
    /// releasing everything when the exclusive half cannot be had.
    fn try_lock_exclusive_ordered(&mut self) -> Result<bool> {
        if !self.try_lock_shared() {
            return Ok(false);
        }
        if self.try_lock_exclusive()? {
            Ok(true)
        } else {
            self.unlock();
            Ok(false)
        }
    }

    fn unlock_shared(&mut self) {
        if self.has_lock(WalLockKind::Shared) {
            // Cross-process lock first, in-process mutex second.
            self.shared_range = None;
            self.shared_guard = None;
            self.locks &= !WalLockKind::Shared.mask();
        }
    }

    fn unlock_exclusive(&mut self) {
        if self.has_lock(WalLockKind::Exclusive) {
            self.exclusive_range = None;
            self.exclusive_guard = None;
            self.locks &= !WalLockKind::Exclusive.mask();
        }
    }

    /// Releases all locks and closes the index file handle.
    pub fn close(&mut self) {
        self.unlock();
        self.file.close();
    }
}

impl std::fmt::Debug for WalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalIndex")
            .field("header", &self.headers[0])
            .field("lock", &self.current_lock())
            .finish()
    }
}

fn load_headers(segment: &SharedSegment) -> [WalIndexHeader; INDEX_HEADER_COPIES] {
    [
        WalIndexHeader::load_from(segment, 0),
        WalIndexHeader::load_from(segment, INDEX_HEADER_BYTES),
    ]
}
