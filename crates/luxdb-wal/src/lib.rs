//! Write-ahead log for the luxdb storage engine.
//!
//! Transactions append page images to the log; a checkpoint later folds them
//! into the main database. Concurrent readers and writers coordinate through
//! a shared-memory index mapped by every cooperating process.
//!
//! The engine owns two files next to the database at `<db>`:
//!
//! ```text
//! <db>-wal    [WAL header: 32 bytes]
//!             [Frame 0: 32-byte header + 4096-byte page]
//!             [Frame 1: 32-byte header + 4096-byte page]
//!             ...
//! <db>-shm    [index header copy 0: 32 bytes]
//!             [index header copy 1: 32 bytes]
//!             [lock bytes: 8]
//!             [frame table header: 16 bytes]
//!             [frame table entries: capacity x 16 bytes]
//! ```
//!
//! The WAL file uses big-endian serialization and a chained FNV-1a checksum;
//! the index file is transient, rebuilt from the WAL on open, and uses native
//! byte order.

mod fnv;
mod frame;
mod header;
mod index;
mod index_header;
mod index_table;
mod iter;
mod wal;

pub use fnv::Fnv1a;
pub use frame::{WalFrame, FRAME_BYTES, FRAME_HEADER_BYTES};
pub use header::{WalHeader, WAL_HEADER_BYTES, WAL_MAGIC};
pub use index::{WalIndex, WalLockKind};
pub use index_header::{FrameCursor, WalIndexHeader, INDEX_HEADER_BYTES};
pub use index_table::{FrameTable, TABLE_INITIAL_CAPACITY, TABLE_MAX_LOAD_FACTOR};
pub use iter::WalIterator;
pub use wal::{Wal, WAL_HEADER_OFFSET};

pub use luxdb_io::{Page, PAGE_BYTES};
