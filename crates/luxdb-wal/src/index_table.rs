//! The frame→page table of the WAL index.
//!
//! An open-addressed, linearly probed map from frame indices (`i32` keys) to
//! page numbers (`i64` values), stored entirely in a shared-memory region of
//! the index file so that cooperating processes can re-attach to it:
//!
//! ```text
//! table header (16 bytes):  capacity: i32 | size: i32 | dataOffset: i64
//! entries (16 bytes each):  key: i32 | padding: i32 | value: i64
//! ```
//!
//! An empty entry is encoded by `key == -1`. Probing is by *value* (the page
//! number), so looking up a page always yields the newest frame holding it,
//! and rewriting a page replaces its entry in place.
//!
//! The `dataOffset` field records where the entry region lives within the
//! index file. Raw addresses are meaningless in another process, so the
//! mapping is always derived from the header position; the stored offset is
//! only verified against it.
//!
//! Not internally synchronized: callers hold the exclusive WAL-index lock
//! while mutating and at least the shared lock while reading.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use luxdb_error::{LuxdbError, Result};
use luxdb_io::{DbFile, SharedSegment};

/// The byte size of the table header.
pub const TABLE_HEADER_BYTES: usize = 16;

/// The byte size of one table entry.
pub const TABLE_ENTRY_BYTES: usize = 16;

/// The capacity of a freshly created table, in entries.
pub const TABLE_INITIAL_CAPACITY: i32 = 4096;

/// The load factor at which an insert triggers a doubling grow.
pub const TABLE_MAX_LOAD_FACTOR: f64 = 0.75;

const CAPACITY_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 4;
const DATA_OFFSET_OFFSET: usize = 8;

const VALUE_OFFSET: usize = 8;

/// Tables past this entry count saturate memory quickly, since every handle
/// re-maps the full region.
const SIZE_WARNING_THRESHOLD: i32 = 655_360;

/// The open-addressed frame→page table backed by shared memory.
pub struct FrameTable {
    file: Arc<DbFile>,
    header_offset: u64,
    header: SharedSegment,
    data: SharedSegment,
    /// Set while the table is being grown, for recursive-grow detection.
    growing: bool,
}

impl FrameTable {
    /// Attaches to the table at `header_offset` within `file`, initializing
    /// an empty table of [`TABLE_INITIAL_CAPACITY`] entries if the region has
    /// never been used.
    pub fn attach(file: Arc<DbFile>, header_offset: u64) -> Result<Self> {
        if header_offset % 8 != 0 {
            return Err(LuxdbError::OutOfRange {
                what: "table header offset",
                value: i64::try_from(header_offset).unwrap_or(i64::MAX),
            });
        }

        let mut header = file.map_shared(header_offset, TABLE_HEADER_BYTES)?;
        let capacity = header.read_i32(CAPACITY_OFFSET);

        let data = if capacity > 0 {
            trace!(capacity, "attaching to pre-allocated frame table data");

            let stored = header.read_i64(DATA_OFFSET_OFFSET);
            let derived = data_file_offset(header_offset);
            if stored != i64::try_from(derived).expect("data offset fits in i64") {
                warn!(
                    stored,
                    derived, "frame table data offset disagrees with its header position"
                );
            }
            file.map_shared(derived, region_bytes(capacity))?
        } else {
            trace!("allocating frame table data, since the region is still empty");

            let mut data = file.map_shared(
                data_file_offset(header_offset),
                region_bytes(TABLE_INITIAL_CAPACITY),
            )?;
            fill_with_empty_entries(&mut data);

            header.write_i32(SIZE_OFFSET, 0);
            header.write_i32(CAPACITY_OFFSET, TABLE_INITIAL_CAPACITY);
            header.write_i64(
                DATA_OFFSET_OFFSET,
                i64::try_from(data_file_offset(header_offset)).expect("data offset fits in i64"),
            );
            data
        };

        Ok(Self {
            file,
            header_offset,
            header,
            data,
            growing: false,
        })
    }

    /// Inserts `(key, value)`. If the page `value` is already present, its
    /// entry is overwritten so the table tracks the newest frame. A new entry
    /// that would push the load factor to [`TABLE_MAX_LOAD_FACTOR`] grows the
    /// table first.
    pub fn put(&mut self, key: i32, value: i64) -> Result<()> {
        let bucket = probe(&self.data, self.capacity(), value);
        if entry_at(&self.data, bucket).is_some() {
            trace!(key, value, bucket, "overwriting frame table entry");
            set_entry(&mut self.data, bucket, key, value);
            return Ok(());
        }

        if self.load_factor() >= TABLE_MAX_LOAD_FACTOR {
            self.grow()?;
        }

        let bucket = probe(&self.data, self.capacity(), value);
        trace!(key, value, bucket, "adding frame table entry");
        set_entry(&mut self.data, bucket, key, value);

        let new_size = self.size() + 1;
        self.header.write_i32(SIZE_OFFSET, new_size);
        if new_size >= SIZE_WARNING_THRESHOLD {
            warn!(size = new_size, "frame table may saturate process memory");
        }
        Ok(())
    }

    /// Returns the key of the entry holding `value`, or `-1` if the value is
    /// not mapped.
    #[must_use]
    pub fn key_of(&self, value: i64) -> i32 {
        let bucket = probe(&self.data, self.capacity(), value);
        match entry_at(&self.data, bucket) {
            Some((key, _)) => key,
            None => -1,
        }
    }

    /// The number of entries in the table.
    #[must_use]
    pub fn size(&self) -> i32 {
        self.header.read_i32(SIZE_OFFSET)
    }

    /// The number of entries the table can hold before growing.
    #[must_use]
    pub fn capacity(&self) -> i32 {
        self.header.read_i32(CAPACITY_OFFSET)
    }

    /// Re-derives the entry mapping from the shared header, picking up a grow
    /// performed through another handle.
    pub fn reload(&mut self) -> Result<()> {
        let capacity = self.capacity();
        self.data = self
            .file
            .map_shared(data_file_offset(self.header_offset), region_bytes(capacity))?;
        Ok(())
    }

    fn load_factor(&self) -> f64 {
        f64::from(self.size()) / f64::from(self.capacity())
    }

    /// Doubles the table capacity and rehashes every live entry.
    fn grow(&mut self) -> Result<()> {
        if self.growing {
            return Err(LuxdbError::RecursiveGrow);
        }

        self.growing = true;
        let result = self.grow_inner();
        self.growing = false;
        result
    }

    fn grow_inner(&mut self) -> Result<()> {
        let old_size = self.size();
        let old_capacity = self.capacity();
        let new_capacity = next_capacity(old_capacity)?;
        debug!(
            old_capacity,
            new_capacity,
            size = old_size,
            "growing frame table"
        );

        // Scratch-copy the live entries before the enlarged region is
        // zeroed; it overlays the existing one.
        let mut live = Vec::with_capacity(usize::try_from(old_size).unwrap_or(0));
        for index in 0..usize::try_from(old_capacity).expect("capacity fits in usize") {
            if let Some(entry) = entry_at(&self.data, index) {
                live.push(entry);
            }
        }

        let mut extended = self.file.map_shared(
            data_file_offset(self.header_offset),
            region_bytes(new_capacity),
        )?;
        fill_with_empty_entries(&mut extended);

        // Size restarts at 0 so the re-inserts land in their new buckets.
        self.header.write_i32(SIZE_OFFSET, 0);
        self.header.write_i32(CAPACITY_OFFSET, new_capacity);
        self.data = extended;

        for (key, value) in live {
            if let Err(e) = self.put(key, value) {
                self.header.write_i32(SIZE_OFFSET, old_size);
                self.header.write_i32(CAPACITY_OFFSET, old_capacity);
                return Err(e);
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for FrameTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameTable")
            .field("capacity", &self.capacity())
            .field("size", &self.size())
            .finish()
    }
}

/// The file offset of the entry region for a table header at `header_offset`.
fn data_file_offset(header_offset: u64) -> u64 {
    header_offset + TABLE_HEADER_BYTES as u64
}

/// The byte size of an entry region holding `capacity` entries.
fn region_bytes(capacity: i32) -> usize {
    usize::try_from(capacity).expect("capacity must be non-negative") * TABLE_ENTRY_BYTES
}

/// The doubled capacity, or an overflow error once it no longer fits `i32`.
fn next_capacity(capacity: i32) -> Result<i32> {
    capacity.checked_mul(2).ok_or(LuxdbError::IntegerOverflow)
}

fn fill_with_empty_entries(segment: &mut SharedSegment) {
    let entries = segment.len() / TABLE_ENTRY_BYTES;
    for index in 0..entries {
        segment.write_i32(index * TABLE_ENTRY_BYTES, -1);
        segment.write_i64(index * TABLE_ENTRY_BYTES + VALUE_OFFSET, 0);
    }
}

/// Returns the entry at `index`, or `None` for the empty sentinel.
fn entry_at(segment: &SharedSegment, index: usize) -> Option<(i32, i64)> {
    let offset = index * TABLE_ENTRY_BYTES;
    let key = segment.read_i32(offset);
    if key == -1 {
        return None;
    }
    Some((key, segment.read_i64(offset + VALUE_OFFSET)))
}

fn set_entry(segment: &mut SharedSegment, index: usize, key: i32, value: i64) {
    let offset = index * TABLE_ENTRY_BYTES;
    segment.write_i32(offset, key);
    segment.write_i64(offset + VALUE_OFFSET, value);
}

/// Walks the probe chain of `value`, stopping at its entry or at the first
/// empty slot. Terminates because the load factor cap is strictly below 1.
fn probe(segment: &SharedSegment, capacity: i32, value: i64) -> usize {
    let capacity = usize::try_from(capacity).expect("capacity must be non-negative");
    let spread = (value as u64) ^ ((value as u64) >> 32);
    let mut bucket = usize::try_from(spread % capacity as u64).expect("bucket fits in usize");

    while let Some((_, occupant)) = entry_at(segment, bucket) {
        if occupant == value {
            break;
        }
        bucket = (bucket + 1) % capacity;
    }

    bucket
}
