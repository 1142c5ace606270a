//! End-to-end WAL lifecycle scenarios.

use std::path::{Path, PathBuf};

use luxdb_error::LuxdbError;
use luxdb_wal::{Page, Wal, FRAME_HEADER_BYTES, PAGE_BYTES, WAL_HEADER_BYTES, WAL_MAGIC};
use tempfile::tempdir;

const PREFIX: [u8; 4] = [1, 3, 3, 7];

/// Opens the WAL, retrying while another test holds the process-wide
/// initializer lock.
fn open_wal(database_path: &Path) -> Wal {
    loop {
        match Wal::open(database_path) {
            Ok(wal) => return wal,
            Err(LuxdbError::InitLockBusy) => std::thread::yield_now(),
            Err(e) => panic!("cannot open WAL: {e}"),
        }
    }
}

fn wal_file_path(database_path: &Path) -> PathBuf {
    let real = std::fs::canonicalize(database_path).expect("canonicalize");
    PathBuf::from(format!("{}-wal", real.display()))
}

/// A page carrying the marker prefix at offsets 0 and 4091.
fn marked_page(index: i64) -> Page {
    let mut page = Page::new(index).expect("page");
    page.data_mut()[0..4].copy_from_slice(&PREFIX);
    page.data_mut()[4091..4095].copy_from_slice(&PREFIX);
    page
}

#[test]
fn empty_open_reports_an_empty_wal() {
    let dir = tempdir().expect("tempdir");
    let wal = open_wal(&dir.path().join("fresh.db"));

    let header = wal.header().expect("header");
    assert!(header.is_valid());
    assert_eq!(header.db_size(), 0);

    assert_eq!(wal.index_header().last_commit_frame(), -1);
    assert_eq!(wal.index_header().cursor(), 0);
}

#[test]
fn open_close_reopen_keeps_the_magic() {
    let dir = tempdir().expect("tempdir");
    let db = dir.path().join("cycle.db");

    let mut wal = open_wal(&db);
    wal.close();
    drop(wal);

    let reopened = open_wal(&db);
    assert_eq!(reopened.header().expect("header").magic(), WAL_MAGIC);
}

#[test]
fn write_without_read_transaction_is_out_of_order() {
    let dir = tempdir().expect("tempdir");
    let mut wal = open_wal(&dir.path().join("order.db"));

    let err = wal
        .begin_write_transaction()
        .expect_err("exclusive without shared must fail");
    assert!(matches!(err, LuxdbError::OutOfOrderLock));
}

#[test]
fn appending_outside_a_write_transaction_is_out_of_order() {
    let dir = tempdir().expect("tempdir");
    let mut wal = open_wal(&dir.path().join("no-tx.db"));

    // No transaction at all.
    let err = wal
        .write_page(&marked_page(1), true)
        .expect_err("append without a write transaction must fail");
    assert!(matches!(err, LuxdbError::OutOfOrderLock));

    // A read transaction alone is not enough either.
    wal.begin_read_transaction().expect("read tx");
    let err = wal
        .write_page(&marked_page(1), true)
        .expect_err("append under a shared lock must fail");
    assert!(matches!(err, LuxdbError::OutOfOrderLock));
    wal.end_read_transaction();

    // Nothing may have reached the log or the index.
    assert_eq!(wal.index_header().cursor(), 0);
    assert_eq!(wal.frame_index_of(1), -1);
}

#[test]
fn single_commit_round_trip() {
    let dir = tempdir().expect("tempdir");
    let mut wal = open_wal(&dir.path().join("commit.db"));

    wal.begin_read_transaction().expect("read tx");
    wal.begin_write_transaction().expect("write tx");

    let page = marked_page(1);
    wal.write_page(&page, true).expect("commit");

    assert_eq!(wal.frame_index_of(1), 0);
    let stored = wal.page_at(0).expect("page");
    assert_eq!(stored, page.data());

    let header = wal.header().expect("header");
    assert!(header.is_valid());
    assert_eq!(header.db_size(), 1);

    wal.end_write_transaction();
    wal.end_read_transaction();
}

#[test]
fn truncated_frame_payload_is_corrupt() {
    let dir = tempdir().expect("tempdir");
    let db = dir.path().join("torn.db");

    let mut wal = open_wal(&db);
    wal.begin_read_transaction().expect("read tx");
    wal.begin_write_transaction().expect("write tx");
    wal.write_page(&marked_page(1), true).expect("commit");
    wal.end_write_transaction();
    wal.end_read_transaction();
    wal.close();
    drop(wal);

    // Truncate the frame payload in half, as a crashed writer would leave it.
    let torn_len = (WAL_HEADER_BYTES + FRAME_HEADER_BYTES + PAGE_BYTES / 2) as u64;
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(wal_file_path(&db))
        .expect("open wal file");
    file.set_len(torn_len).expect("truncate");
    drop(file);

    let mut reopened = open_wal(&db);
    reopened.begin_read_transaction().expect("read tx");
    let err = reopened.page_at(0).expect_err("torn page must fail");
    assert!(matches!(err, LuxdbError::CorruptPage { .. }));
    reopened.end_read_transaction();
}

#[test]
fn large_append_yields_ordered_frames() {
    let dir = tempdir().expect("tempdir");
    let mut wal = open_wal(&dir.path().join("large.db"));

    wal.begin_read_transaction().expect("read tx");
    wal.begin_write_transaction().expect("write tx");
    for page_index in 1..=1024_i64 {
        wal.write_page(&marked_page(page_index), true).expect("commit");
    }
    wal.end_write_transaction();

    // Size and order are visible under the shared lock.
    wal.begin_read_transaction().expect("read tx");
    let frames = wal.frames().expect("iterator");
    assert_eq!(frames.len(), 1024);

    let mut previous = 0_i64;
    for frame in frames {
        let frame = frame.expect("frame");
        assert!(frame.page_index() > previous, "page indices must increase");
        previous = frame.page_index();
        assert_eq!(&frame.page()[0..4], &PREFIX);
    }
    assert_eq!(previous, 1024);
    wal.end_read_transaction();
}

#[test]
fn rewriting_a_page_resolves_to_the_newest_frame() {
    let dir = tempdir().expect("tempdir");
    let mut wal = open_wal(&dir.path().join("rewrite.db"));

    wal.begin_read_transaction().expect("read tx");
    wal.begin_write_transaction().expect("write tx");
    wal.write_page(&marked_page(7), true).expect("first commit");
    wal.write_page(&marked_page(8), true).expect("second commit");
    wal.write_page(&marked_page(7), true).expect("rewrite commit");

    assert_eq!(wal.frame_index_of(7), 2, "page 7 was rewritten at frame 2");
    assert_eq!(wal.frame_index_of(8), 1);
    assert_eq!(wal.frame_index_of(9), -1, "page 9 lives in the main database");

    wal.end_write_transaction();
    wal.end_read_transaction();
}

#[test]
fn engine_grows_the_frame_table() {
    let dir = tempdir().expect("tempdir");
    let mut wal = open_wal(&dir.path().join("grow.db"));

    wal.begin_read_transaction().expect("read tx");
    wal.begin_write_transaction().expect("write tx");

    // One frame past the initial table capacity; only the last frame commits.
    for page_index in 1..=4097_i64 {
        wal.write_page(&marked_page(page_index), page_index == 4097)
            .expect("append");
    }

    for page_index in 1..=4097_i64 {
        let expected = i32::try_from(page_index - 1).expect("frame index fits");
        assert_eq!(wal.frame_index_of(page_index), expected);
    }
    assert_eq!(wal.index_header().last_commit_frame(), 4096);

    wal.end_write_transaction();
    wal.end_read_transaction();
}

#[test]
fn page_reads_outside_the_commit_boundary_fail() {
    let dir = tempdir().expect("tempdir");
    let mut wal = open_wal(&dir.path().join("bounds.db"));

    wal.begin_read_transaction().expect("read tx");
    wal.begin_write_transaction().expect("write tx");
    wal.write_page(&marked_page(1), true).expect("commit");

    assert!(matches!(
        wal.page_at(-1).expect_err("negative index"),
        LuxdbError::OutOfRange { value: -1, .. }
    ));
    assert!(matches!(
        wal.page_at(1).expect_err("past the commit boundary"),
        LuxdbError::NoSuchPage { frame: 1 }
    ));

    wal.end_write_transaction();
    wal.end_read_transaction();
}

#[test]
fn stale_snapshot_fails_the_write_upgrade() {
    let dir = tempdir().expect("tempdir");
    let db = dir.path().join("stale.db");

    // Two connections to the same database, as two threads would hold them.
    let mut reader = open_wal(&db);
    let mut writer = open_wal(&db);

    reader.begin_read_transaction().expect("reader read tx");

    writer.begin_read_transaction().expect("writer read tx");
    writer.begin_write_transaction().expect("writer write tx");
    writer.write_page(&marked_page(1), true).expect("commit");
    writer.end_write_transaction();

    // The reader's snapshot predates the commit; the upgrade must fail and
    // release every lock so the reader can restart.
    let err = reader
        .begin_write_transaction()
        .expect_err("stale snapshot must fail");
    assert!(matches!(err, LuxdbError::StaleWal));
    assert!(err.is_transient());

    // Retrying from the read boundary observes the new commit.
    reader.begin_read_transaction().expect("fresh read tx");
    assert_eq!(reader.frame_index_of(1), 0);
    let stored = reader.page_at(0).expect("page");
    assert_eq!(&stored[0..4], &PREFIX);
    reader.end_read_transaction();
}

#[test]
fn reopened_wal_rebuilds_its_index_from_the_log() {
    let dir = tempdir().expect("tempdir");
    let db = dir.path().join("rebuild.db");

    let mut wal = open_wal(&db);
    wal.begin_read_transaction().expect("read tx");
    wal.begin_write_transaction().expect("write tx");
    for page_index in 1..=3_i64 {
        wal.write_page(&marked_page(page_index), page_index == 3)
            .expect("append");
    }
    wal.end_write_transaction();
    wal.end_read_transaction();
    wal.close();
    drop(wal);

    // Drop the index file entirely; it is transient and must be rebuilt by
    // iterating the WAL.
    let real = std::fs::canonicalize(&db).expect("canonicalize");
    std::fs::remove_file(format!("{}-shm", real.display())).expect("remove index");

    let mut reopened = open_wal(&db);
    reopened.begin_read_transaction().expect("read tx");
    assert_eq!(reopened.index_header().last_commit_frame(), 2);
    assert_eq!(reopened.index_header().db_size(), 3);
    for page_index in 1..=3_i64 {
        let expected = i32::try_from(page_index - 1).expect("fits");
        assert_eq!(reopened.frame_index_of(page_index), expected);
    }
    reopened.end_read_transaction();
}

#[test]
fn writes_after_close_are_fatal() {
    let dir = tempdir().expect("tempdir");
    let mut wal = open_wal(&dir.path().join("closed.db"));
    wal.close();

    let err = wal
        .write_page(&marked_page(1), true)
        .expect_err("write on a closed WAL must fail");
    assert!(matches!(err, LuxdbError::WriteFatal { .. }));
    assert!(!err.is_transient());
}

#[test]
fn non_empty_database_without_a_wal_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let db = dir.path().join("populated.db");
    std::fs::write(&db, vec![0_u8; 2 * PAGE_BYTES]).expect("seed database");

    let err = loop {
        match Wal::open(&db) {
            Ok(_) => panic!("opening a WAL for a populated database must fail"),
            Err(LuxdbError::InitLockBusy) => std::thread::yield_now(),
            Err(e) => break e,
        }
    };
    assert!(matches!(err, LuxdbError::NotImplemented(_)));
}
