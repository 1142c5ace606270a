//! The WAL-index header.
//!
//! The shared-memory segment stores two consecutive copies of this 32-byte
//! record. Fields are native byte order (the index is rebuilt from the WAL on
//! open and never moves between architectures):
//!
//! ```text
//! Offset  Size  Field
//!   0       4   lastCommitFrame (i32, -1 if none)
//!   4       4   cursor (i32, index of the next frame to append)
//!   8       4   randomSalt (i32)
//!  12       4   sequentialSalt (i32)
//!  16       8   dbSize (i64, pages)
//!  24       8   cumulativeChecksum (u64)
//! ```
//!
//! The duplication is the concurrency protocol's kernel: readers load both
//! copies and retry when they differ; writers update copy 0 then copy 1,
//! only while holding the exclusive lock.

use luxdb_io::SharedSegment;

use crate::fnv::Fnv1a;
use crate::frame::WalFrame;

/// The byte size of one serialized index-header copy.
pub const INDEX_HEADER_BYTES: usize = 32;

const LAST_COMMIT_FRAME_OFFSET: usize = 0;
const CURSOR_OFFSET: usize = 4;
const RANDOM_SALT_OFFSET: usize = 8;
const SEQUENTIAL_SALT_OFFSET: usize = 12;
const DB_SIZE_OFFSET: usize = 16;
const CHECKSUM_OFFSET: usize = 24;

/// The index of the next frame slot to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCursor {
    position: i32,
}

impl FrameCursor {
    /// Creates a cursor at the given position.
    #[must_use]
    pub fn new(position: i32) -> Self {
        debug_assert!(position >= 0, "cursor position must be non-negative");
        Self { position }
    }

    /// The current position.
    #[must_use]
    pub fn position(&self) -> i32 {
        self.position
    }

    /// Advances the cursor by one frame.
    pub fn increment(&mut self) {
        self.position = self
            .position
            .checked_add(1)
            .expect("frame cursor overflowed i32");
    }
}

/// An in-memory mirror of one shared-memory index-header copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalIndexHeader {
    last_commit_frame: i32,
    cursor: FrameCursor,
    random_salt: i32,
    sequential_salt: i32,
    db_size: i64,
    cumulative_checksum: u64,
}

impl WalIndexHeader {
    /// Creates the header of a brand-new, empty WAL index: no commit frame,
    /// cursor at 0, and the empty hash state as the cumulative checksum.
    #[must_use]
    pub fn initial(db_size: i64, random_salt: i32, sequential_salt: i32) -> Self {
        Self {
            last_commit_frame: -1,
            cursor: FrameCursor::new(0),
            random_salt,
            sequential_salt,
            db_size,
            cumulative_checksum: Fnv1a::new().state(),
        }
    }

    /// Loads a header copy from `segment` at byte `offset`.
    #[must_use]
    pub fn load_from(segment: &SharedSegment, offset: usize) -> Self {
        Self {
            last_commit_frame: segment.read_i32(offset + LAST_COMMIT_FRAME_OFFSET),
            cursor: FrameCursor::new(segment.read_i32(offset + CURSOR_OFFSET)),
            random_salt: segment.read_i32(offset + RANDOM_SALT_OFFSET),
            sequential_salt: segment.read_i32(offset + SEQUENTIAL_SALT_OFFSET),
            db_size: segment.read_i64(offset + DB_SIZE_OFFSET),
            cumulative_checksum: segment.read_u64(offset + CHECKSUM_OFFSET),
        }
    }

    /// Writes this header copy into `segment` at byte `offset`.
    pub fn store_to(&self, segment: &mut SharedSegment, offset: usize) {
        segment.write_i32(offset + LAST_COMMIT_FRAME_OFFSET, self.last_commit_frame);
        segment.write_i32(offset + CURSOR_OFFSET, self.cursor.position());
        segment.write_i32(offset + RANDOM_SALT_OFFSET, self.random_salt);
        segment.write_i32(offset + SEQUENTIAL_SALT_OFFSET, self.sequential_salt);
        segment.write_i64(offset + DB_SIZE_OFFSET, self.db_size);
        segment.write_u64(offset + CHECKSUM_OFFSET, self.cumulative_checksum);
    }

    /// Accounts for a frame appended at `frame_index`: advances the cursor,
    /// adopts the frame's cumulative checksum, grows the database size, and,
    /// for commit frames, moves the last-commit marker.
    ///
    /// Until the next publish the divergence from the mapped copies is
    /// visible to the writing thread only; if the commit fails, this mirror
    /// is simply discarded.
    pub fn notify_appended(&mut self, frame: &WalFrame, frame_index: i32) {
        debug_assert!(frame_index >= 0, "frame index must be non-negative");

        self.cursor.increment();
        self.cumulative_checksum = frame.checksum();
        self.db_size += 1;
        if frame.is_commit() {
            self.last_commit_frame = frame_index;
        }
    }

    /// Whether the WAL contains no committed frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last_commit_frame == -1
    }

    /// Whether this mirror carries the all-zero pattern of a segment that
    /// was never written. A legitimately empty index reads
    /// `last_commit_frame == -1`, so the two states are distinguishable.
    #[must_use]
    pub fn is_unmapped(&self) -> bool {
        self.last_commit_frame == 0
            && self.cursor.position() == 0
            && self.random_salt == 0
            && self.sequential_salt == 0
            && self.db_size == 0
            && self.cumulative_checksum == 0
    }

    /// The index of the newest committed frame, or -1 if none.
    #[must_use]
    pub fn last_commit_frame(&self) -> i32 {
        self.last_commit_frame
    }

    /// The index of the next frame to append.
    #[must_use]
    pub fn cursor(&self) -> i32 {
        self.cursor.position()
    }

    /// The random salt of the current checkpoint epoch.
    #[must_use]
    pub fn random_salt(&self) -> i32 {
        self.random_salt
    }

    /// The sequential salt of the current checkpoint epoch.
    #[must_use]
    pub fn sequential_salt(&self) -> i32 {
        self.sequential_salt
    }

    /// The database size in pages.
    #[must_use]
    pub fn db_size(&self) -> i64 {
        self.db_size
    }

    /// The cumulative checksum of all appended frames.
    #[must_use]
    pub fn cumulative_checksum(&self) -> u64 {
        self.cumulative_checksum
    }
}
