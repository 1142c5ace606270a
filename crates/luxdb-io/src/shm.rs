//! Memory-mapped shared segments.
//!
//! A [`SharedSegment`] is a read-write window over a region of a file, mapped
//! shared so that every process mapping the same file observes the same
//! bytes. Field accessors use native byte order: the index file is rebuilt
//! from the WAL on open and is never moved between architectures.
//!
//! The mapping always starts at file offset zero and the requested region is
//! exposed as a window, which keeps the map offset page-aligned regardless of
//! where the region itself starts.

use std::fs::File;

use memmap2::{MmapMut, MmapOptions};

use luxdb_error::Result;

/// A shared, writable mapping of a file region.
pub struct SharedSegment {
    map: MmapMut,
    base: usize,
    len: usize,
}

impl SharedSegment {
    /// Maps `len` bytes of `file` starting at `offset`.
    ///
    /// The file must already be at least `offset + len` bytes long.
    pub(crate) fn map(file: &File, offset: u64, len: usize) -> Result<Self> {
        let base = usize::try_from(offset).expect("shared segment offset must fit in usize");
        let total = base + len;
        // Safety: the mapping is shared on purpose; concurrent mutation by
        // cooperating processes is the whole point of this structure, and all
        // multi-byte accesses go through the checked accessors below.
        let map = unsafe { MmapOptions::new().len(total).map_mut(file)? };
        Ok(Self { map, base, len })
    }

    /// The size of this segment in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether this segment is zero-length.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fills the whole segment with `byte`.
    pub fn fill(&mut self, byte: u8) {
        self.bytes_mut().fill(byte);
    }

    /// The segment contents as a byte slice.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.map[self.base..self.base + self.len]
    }

    /// The segment contents as a mutable byte slice.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map[self.base..self.base + self.len]
    }

    /// Read a native-order `i32` at the given byte offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4 > self.len()`.
    #[must_use]
    pub fn read_i32(&self, offset: usize) -> i32 {
        let bytes: [u8; 4] = self.bytes()[offset..offset + 4]
            .try_into()
            .expect("slice is exactly 4 bytes");
        i32::from_ne_bytes(bytes)
    }

    /// Write a native-order `i32` at the given byte offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4 > self.len()`.
    pub fn write_i32(&mut self, offset: usize, value: i32) {
        self.bytes_mut()[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    /// Read a native-order `i64` at the given byte offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 8 > self.len()`.
    #[must_use]
    pub fn read_i64(&self, offset: usize) -> i64 {
        let bytes: [u8; 8] = self.bytes()[offset..offset + 8]
            .try_into()
            .expect("slice is exactly 8 bytes");
        i64::from_ne_bytes(bytes)
    }

    /// Write a native-order `i64` at the given byte offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 8 > self.len()`.
    pub fn write_i64(&mut self, offset: usize, value: i64) {
        self.bytes_mut()[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }

    /// Read a native-order `u64` at the given byte offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 8 > self.len()`.
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        let bytes: [u8; 8] = self.bytes()[offset..offset + 8]
            .try_into()
            .expect("slice is exactly 8 bytes");
        u64::from_ne_bytes(bytes)
    }

    /// Write a native-order `u64` at the given byte offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 8 > self.len()`.
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.bytes_mut()[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::file::{DbFile, OpenFlags};

    fn mapped_file(len: usize) -> (tempfile::TempDir, DbFile, crate::shm::SharedSegment) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seg.db");
        let file = DbFile::open(&path, OpenFlags::READ_WRITE_CREATE).expect("open");
        let segment = file.map_shared(0, len).expect("map");
        (dir, file, segment)
    }

    #[test]
    fn fresh_segment_is_zeroed() {
        let (_dir, _file, segment) = mapped_file(256);
        assert_eq!(segment.len(), 256);
        assert!(segment.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn typed_accessors_round_trip() {
        let (_dir, _file, mut segment) = mapped_file(64);
        segment.write_i32(0, -1);
        segment.write_i32(4, 42);
        segment.write_i64(8, -7);
        segment.write_u64(16, 0xCBF2_9CE4_8422_2325);

        assert_eq!(segment.read_i32(0), -1);
        assert_eq!(segment.read_i32(4), 42);
        assert_eq!(segment.read_i64(8), -7);
        assert_eq!(segment.read_u64(16), 0xCBF2_9CE4_8422_2325);
    }

    #[test]
    fn fill_overwrites_every_byte() {
        let (_dir, _file, mut segment) = mapped_file(32);
        segment.write_i64(0, i64::MAX);
        segment.fill(0);
        assert!(segment.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn windowed_segment_offsets_are_relative() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seg.db");
        let file = DbFile::open(&path, OpenFlags::READ_WRITE_CREATE).expect("open");

        let mut window = file.map_shared(72, 16).expect("map window");
        window.write_i32(0, 4096);

        let whole = file.map_shared(0, 96).expect("map whole");
        assert_eq!(whole.read_i32(72), 4096);
    }
}
