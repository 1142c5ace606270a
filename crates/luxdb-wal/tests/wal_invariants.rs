//! Cross-cutting WAL invariants: checksum chaining, snapshot idempotence,
//! epoch filtering, and multi-connection interleaving.

use std::path::Path;
use std::sync::Arc;

use luxdb_error::LuxdbError;
use luxdb_io::{DbFile, OpenFlags, Page, PAGE_BYTES};
use luxdb_wal::{
    Fnv1a, Wal, WalFrame, WalHeader, WalIndex, FRAME_BYTES, FRAME_HEADER_BYTES, WAL_HEADER_BYTES,
};
use tempfile::tempdir;

fn open_wal(database_path: &Path) -> Wal {
    loop {
        match Wal::open(database_path) {
            Ok(wal) => return wal,
            Err(LuxdbError::InitLockBusy) => std::thread::yield_now(),
            Err(e) => panic!("cannot open WAL: {e}"),
        }
    }
}

fn filled_page(index: i64, fill: u8) -> Page {
    Page::with_data(index, vec![fill; PAGE_BYTES]).expect("page")
}

/// For all frames written and committed, the cumulative hash over frames
/// `0..=n` equals the checksum stored in frame `n`.
#[test]
fn cumulative_checksums_chain_over_the_whole_log() {
    let dir = tempdir().expect("tempdir");
    let mut wal = open_wal(&dir.path().join("chain.db"));

    wal.begin_read_transaction().expect("read tx");
    wal.begin_write_transaction().expect("write tx");
    for page_index in 1..=16_i64 {
        let fill = u8::try_from(page_index).expect("fits");
        wal.write_page(&filled_page(page_index, fill), page_index % 4 == 0)
            .expect("append");
    }
    wal.end_write_transaction();

    wal.begin_read_transaction().expect("read tx");
    let mut running = Fnv1a::new().state();
    let mut last_checksum = running;
    for frame in wal.frames().expect("iterator") {
        let frame = frame.expect("frame");
        running = Fnv1a::seeded(running)
            .mix_i64(frame.page_index())
            .mix_bool(frame.is_commit())
            .mix_i32(frame.random_salt())
            .mix_i32(frame.sequential_salt())
            .mix_bytes(frame.page())
            .state();
        assert_eq!(frame.checksum(), running, "stored checksum must chain");
        last_checksum = running;
    }
    assert_eq!(
        wal.index_header().cumulative_checksum(),
        last_checksum,
        "the index mirrors the newest frame checksum"
    );
    wal.end_read_transaction();
}

/// Serializing a header read back from disk yields the original bytes.
#[test]
fn wal_header_survives_a_file_round_trip() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("header-wal");
    let file = DbFile::open(&path, OpenFlags::READ_WRITE_CREATE).expect("open");

    let header = WalHeader::new(123, 4, -55, 66).expect("header");
    let original = header.to_bytes();
    file.write(&original, 0).expect("write");

    let read_back = WalHeader::read_from(&file, 0).expect("read");
    assert_eq!(read_back, header);
    assert_eq!(read_back.to_bytes(), original);
}

/// Two reloads with no intervening writer leave the snapshot unchanged.
#[test]
fn reload_is_idempotent_without_writers() {
    let dir = tempdir().expect("tempdir");
    let shm_path = dir.path().join("idem-shm");
    let shm = Arc::new(DbFile::open(&shm_path, OpenFlags::READ_WRITE_CREATE).expect("open"));

    let mut index = WalIndex::build_initial(0, 11, 12, shm).expect("build");
    index.reload().expect("first reload");
    let first = index.header().clone();
    index.reload().expect("second reload");
    assert_eq!(*index.header(), first);
}

/// Frames whose salts predate the current WAL header are checkpoint
/// leftovers and must not enter a rebuilt index.
#[test]
fn rebuild_skips_frames_from_an_older_epoch() {
    let dir = tempdir().expect("tempdir");
    let wal_path = dir.path().join("epoch-wal");
    let shm_path = dir.path().join("epoch-shm");

    let wal = Arc::new(DbFile::open(&wal_path, OpenFlags::READ_WRITE_CREATE).expect("open wal"));

    // The header is already in the next epoch (salts 9/10)...
    let header = WalHeader::new(0, 1, 9, 10).expect("header");
    wal.write(&header.to_bytes(), 0).expect("write header");

    // ...while the log still carries two frames of the previous epoch (7/8)
    // and one of the current epoch.
    let seed = Fnv1a::new().state();
    let mut offset = WAL_HEADER_BYTES as u64;
    let mut write_frame = |frame: &WalFrame| {
        wal.write(&frame.header_bytes(), offset).expect("frame header");
        wal.write(frame.page(), offset + FRAME_HEADER_BYTES as u64)
            .expect("frame page");
        offset += FRAME_BYTES as u64;
    };

    let stale_a = WalFrame::build(1, false, 7, 8, &vec![1_u8; PAGE_BYTES], seed).expect("frame");
    let stale_b =
        WalFrame::build(2, true, 7, 8, &vec![2_u8; PAGE_BYTES], stale_a.checksum()).expect("frame");
    let current = WalFrame::build(3, true, 9, 10, &vec![3_u8; PAGE_BYTES], seed).expect("frame");
    write_frame(&stale_a);
    write_frame(&stale_b);
    write_frame(&current);

    let shm = Arc::new(DbFile::open(&shm_path, OpenFlags::READ_WRITE_CREATE).expect("open shm"));
    let index = WalIndex::build_from_existing(&wal, shm).expect("rebuild");

    assert_eq!(index.find_frame_index_of(1), -1, "previous epoch is invisible");
    assert_eq!(index.find_frame_index_of(2), -1, "previous epoch is invisible");
    assert_eq!(index.find_frame_index_of(3), 0, "current epoch is indexed");
    assert_eq!(index.header().cursor(), 1);
}

/// Several connections committing in turn: stale upgrades are retried from
/// the read boundary and every page ends up locatable.
#[test]
fn interleaved_writers_retry_stale_snapshots() {
    let dir = tempdir().expect("tempdir");
    let db = dir.path().join("interleave.db");

    // Create the WAL before the writers race for it.
    drop(open_wal(&db));

    let writers = 4_i64;
    let commits_per_writer = 8_i64;

    std::thread::scope(|scope| {
        for writer in 0..writers {
            let db = db.clone();
            scope.spawn(move || {
                let mut wal = open_wal(&db);
                for i in 0..commits_per_writer {
                    let page_index = writer * commits_per_writer + i + 1;
                    let fill = u8::try_from(page_index % 251).expect("fits");
                    loop {
                        match wal.begin_read_transaction() {
                            Ok(()) => {}
                            Err(e) if e.is_transient() => continue,
                            Err(e) => panic!("read tx: {e}"),
                        }
                        match wal.begin_write_transaction() {
                            Ok(()) => {}
                            Err(e) if e.is_transient() => continue,
                            Err(e) => panic!("write tx: {e}"),
                        }
                        wal.write_page(&filled_page(page_index, fill), true)
                            .expect("commit");
                        wal.end_write_transaction();
                        break;
                    }
                }
            });
        }
    });

    let mut verifier = open_wal(&db);
    loop {
        match verifier.begin_read_transaction() {
            Ok(()) => break,
            Err(e) if e.is_transient() => continue,
            Err(e) => panic!("verifier read tx: {e}"),
        }
    }

    let total = writers * commits_per_writer;
    assert_eq!(verifier.index_header().db_size(), total);
    for page_index in 1..=total {
        let frame = verifier.frame_index_of(page_index);
        assert!(frame >= 0, "page {page_index} must be locatable");
        let fill = u8::try_from(page_index % 251).expect("fits");
        let stored = verifier.page_at(frame).expect("page");
        assert!(stored.iter().all(|&b| b == fill), "page {page_index} intact");
    }
    verifier.end_read_transaction();
}
