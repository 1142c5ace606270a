//! Sequential traversal of committed WAL frames.

use std::sync::Arc;

use luxdb_error::{LuxdbError, Result};
use luxdb_io::DbFile;

use crate::frame::{WalFrame, FRAME_BYTES};
use crate::header::WAL_HEADER_BYTES;
use crate::index_header::WalIndexHeader;

/// An ordered, sized iterator over the frames of a WAL file.
///
/// When the index header knows the commit boundary, exactly
/// `last_commit_frame + 1` frames are yielded. Otherwise the count is derived
/// from the file size, ignoring any trailing partial frame; a partial frame
/// is evidence of an in-flight writer and is the engine's concern elsewhere.
#[derive(Debug)]
pub struct WalIterator {
    wal: Arc<DbFile>,
    frame_count: i32,
    cursor: i32,
}

impl WalIterator {
    /// Creates an iterator over `wal`, sized from `index_header`.
    ///
    /// Fails with a corrupt-WAL error if the file is smaller than the WAL
    /// header.
    pub fn new(index_header: &WalIndexHeader, wal: Arc<DbFile>) -> Result<Self> {
        let wal_size = wal.size()?;
        if wal_size < WAL_HEADER_BYTES as u64 {
            return Err(LuxdbError::corrupt_wal(
                "WAL file contains an invalid or incomplete header",
            ));
        }

        Ok(Self {
            wal,
            frame_count: frame_count(wal_size, index_header),
            cursor: 0,
        })
    }

    /// The total number of frames this iterator yields.
    #[must_use]
    pub fn len(&self) -> usize {
        usize::try_from(self.frame_count - self.cursor).expect("frame count is non-negative")
    }

    /// Whether no frames remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cursor == self.frame_count
    }
}

/// The number of frames to read from the WAL.
///
/// `last_commit_frame` bounds the traversal when the index knows it; for a
/// never-mapped index the count falls back to the file size, rounded down to
/// whole frames.
fn frame_count(wal_size: u64, index_header: &WalIndexHeader) -> i32 {
    let from_index = index_header.last_commit_frame() + 1;
    if from_index > 0 {
        return from_index;
    }

    let base = wal_size - WAL_HEADER_BYTES as u64;
    let whole_frames = (base - base % FRAME_BYTES as u64) / FRAME_BYTES as u64;
    i32::try_from(whole_frames).expect("WAL frame count fits in i32")
}

impl Iterator for WalIterator {
    type Item = Result<WalFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == self.frame_count {
            return None;
        }

        let offset = WAL_HEADER_BYTES as u64 + u64::try_from(self.cursor).expect("cursor is non-negative") * FRAME_BYTES as u64;
        self.cursor += 1;

        let mut buf = vec![0_u8; FRAME_BYTES];
        match self.wal.read(&mut buf, offset) {
            Ok(bytes_read) if bytes_read == FRAME_BYTES => Some(WalFrame::from_bytes(&buf)),
            Ok(bytes_read) => Some(Err(LuxdbError::corrupt_wal(format!(
                "could only read {bytes_read}/{FRAME_BYTES} bytes of WAL frame {}",
                self.cursor - 1
            )))),
            Err(e) => Some(Err(e)),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for WalIterator {}

#[cfg(test)]
mod tests {
    use luxdb_io::{OpenFlags, PAGE_BYTES};

    use super::*;
    use crate::fnv::Fnv1a;
    use crate::frame::FRAME_HEADER_BYTES;
    use crate::header::WalHeader;

    struct Fixture {
        _dir: tempfile::TempDir,
        wal: Arc<DbFile>,
        header: WalIndexHeader,
        checksum: u64,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db-wal");
        let wal = Arc::new(DbFile::open(&path, OpenFlags::READ_WRITE_CREATE).expect("open"));

        let file_header = WalHeader::new(0, 0, 5, 6).expect("header");
        wal.write(&file_header.to_bytes(), 0).expect("write header");

        Fixture {
            _dir: dir,
            wal,
            header: WalIndexHeader::initial(0, 5, 6),
            checksum: Fnv1a::new().state(),
        }
    }

    fn append(fixture: &mut Fixture, page_index: i64, commit: bool) {
        let page = vec![u8::try_from(page_index % 251).expect("fits"); PAGE_BYTES];
        let frame = WalFrame::build(page_index, commit, 5, 6, &page, fixture.checksum)
            .expect("frame");
        let cursor = fixture.header.cursor();
        let offset = WAL_HEADER_BYTES as u64 + u64::try_from(cursor).expect("fits") * FRAME_BYTES as u64;

        fixture.wal.write(&frame.header_bytes(), offset).expect("write header");
        fixture
            .wal
            .write(frame.page(), offset + FRAME_HEADER_BYTES as u64)
            .expect("write page");
        fixture.header.notify_appended(&frame, cursor);
        fixture.checksum = frame.checksum();
    }

    #[test]
    fn empty_wal_yields_nothing() {
        let fixture = fixture();
        let mut iter = WalIterator::new(&fixture.header, Arc::clone(&fixture.wal)).expect("iter");
        assert_eq!(iter.len(), 0);
        assert!(iter.next().is_none());
    }

    #[test]
    fn yields_exactly_the_committed_frames_in_order() {
        let mut fixture = fixture();
        for page in 1..=5_i64 {
            append(&mut fixture, page, page == 5);
        }

        let iter = WalIterator::new(&fixture.header, Arc::clone(&fixture.wal)).expect("iter");
        assert_eq!(iter.len(), 5);

        let frames: Vec<WalFrame> = iter.map(|f| f.expect("frame")).collect();
        assert_eq!(frames.len(), 5);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.page_index(), i64::try_from(i).expect("fits") + 1);
        }
        assert!(frames[4].is_commit());
    }

    #[test]
    fn frames_past_the_commit_boundary_are_invisible() {
        let mut fixture = fixture();
        append(&mut fixture, 1, true);
        // Two appended but uncommitted frames from an in-flight transaction.
        append(&mut fixture, 2, false);
        append(&mut fixture, 3, false);

        let iter = WalIterator::new(&fixture.header, Arc::clone(&fixture.wal)).expect("iter");
        assert_eq!(iter.len(), 1, "only the committed prefix is yielded");
        let frames: Vec<WalFrame> = iter.map(|f| f.expect("frame")).collect();
        assert_eq!(frames[0].page_index(), 1);
    }

    #[test]
    fn unknown_commit_boundary_falls_back_to_the_file_size() {
        let mut fixture = fixture();
        append(&mut fixture, 1, false);
        append(&mut fixture, 2, false);

        // The index header never saw a commit, so the count comes from the
        // file size.
        let empty_header = WalIndexHeader::initial(0, 5, 6);
        let iter = WalIterator::new(&empty_header, Arc::clone(&fixture.wal)).expect("iter");
        assert_eq!(iter.len(), 2);
    }

    #[test]
    fn trailing_partial_frame_is_ignored() {
        let mut fixture = fixture();
        append(&mut fixture, 1, false);

        // Torn tail: half a frame from an in-flight writer.
        let tail = vec![0xEE_u8; FRAME_BYTES / 2];
        let offset = WAL_HEADER_BYTES as u64 + FRAME_BYTES as u64;
        fixture.wal.write(&tail, offset).expect("write tail");

        let empty_header = WalIndexHeader::initial(0, 5, 6);
        let iter = WalIterator::new(&empty_header, Arc::clone(&fixture.wal)).expect("iter");
        assert_eq!(iter.len(), 1);
    }

    #[test]
    fn file_smaller_than_the_header_is_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db-wal");
        let wal = Arc::new(DbFile::open(&path, OpenFlags::READ_WRITE_CREATE).expect("open"));
        wal.write(&[0_u8; 10], 0).expect("write");

        let header = WalIndexHeader::initial(0, 0, 0);
        let err = WalIterator::new(&header, wal).expect_err("must fail");
        assert!(matches!(err, LuxdbError::CorruptWal { .. }));
    }
}
