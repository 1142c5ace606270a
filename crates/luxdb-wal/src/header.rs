//! The WAL file header.
//!
//! A fixed 32-byte record at offset 0 of the WAL file, serialized big-endian:
//!
//! ```text
//! Offset  Size  Field
//!   0       4   magic (0x4C555831, "LUX1")
//!   4       8   dbSize (database size in pages at last commit; 0 if unknown)
//!  12       4   checkpointSequence
//!  16       4   randomSalt (regenerated on each checkpoint)
//!  20       4   sequentialSalt (incremented on each checkpoint)
//!  24       8   checksum (FNV-1a of the preceding 24 bytes)
//! ```

use luxdb_error::{LuxdbError, Result};
use luxdb_io::DbFile;

use crate::fnv::Fnv1a;

/// The WAL header magic, `"LUX1"`.
pub const WAL_MAGIC: i32 = 0x4C55_5831;

/// The byte size of a serialized WAL header.
pub const WAL_HEADER_BYTES: usize = 32;

/// An in-memory copy of the header of a WAL file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    magic: i32,
    db_size: i64,
    checkpoint_sequence: i32,
    random_salt: i32,
    sequential_salt: i32,
    checksum: u64,
}

impl WalHeader {
    /// Creates a new header with a freshly computed checksum.
    pub fn new(
        db_size: i64,
        checkpoint_sequence: i32,
        random_salt: i32,
        sequential_salt: i32,
    ) -> Result<Self> {
        if db_size < 0 {
            return Err(LuxdbError::OutOfRange {
                what: "database size",
                value: db_size,
            });
        }
        if checkpoint_sequence < 0 {
            return Err(LuxdbError::OutOfRange {
                what: "checkpoint sequence",
                value: i64::from(checkpoint_sequence),
            });
        }

        let checksum = compute_checksum(
            WAL_MAGIC,
            db_size,
            checkpoint_sequence,
            random_salt,
            sequential_salt,
        );
        Ok(Self {
            magic: WAL_MAGIC,
            db_size,
            checkpoint_sequence,
            random_salt,
            sequential_salt,
            checksum,
        })
    }

    /// Creates a copy of this header with an updated database size and a
    /// recomputed checksum. Used when a commit frame is written.
    pub fn with_db_size(&self, db_size: i64) -> Result<Self> {
        Self::new(
            db_size,
            self.checkpoint_sequence,
            self.random_salt,
            self.sequential_salt,
        )
    }

    /// Reads and validates a header from `wal` at `offset`.
    ///
    /// Fails with a corrupt-WAL error if fewer than [`WAL_HEADER_BYTES`] are
    /// present or the checksum does not match.
    pub fn read_from(wal: &DbFile, offset: u64) -> Result<Self> {
        let mut buf = [0_u8; WAL_HEADER_BYTES];
        let bytes_read = wal.read(&mut buf, offset)?;
        if bytes_read != WAL_HEADER_BYTES {
            return Err(LuxdbError::corrupt_wal(format!(
                "could only read {bytes_read}/{WAL_HEADER_BYTES} bytes of the WAL header"
            )));
        }

        Self::from_bytes(&buf)
    }

    /// Parses and validates a header from a 32-byte big-endian buffer.
    pub fn from_bytes(buf: &[u8; WAL_HEADER_BYTES]) -> Result<Self> {
        let header = Self {
            magic: i32::from_be_bytes(buf[0..4].try_into().expect("slice is 4 bytes")),
            db_size: i64::from_be_bytes(buf[4..12].try_into().expect("slice is 8 bytes")),
            checkpoint_sequence: i32::from_be_bytes(buf[12..16].try_into().expect("slice is 4 bytes")),
            random_salt: i32::from_be_bytes(buf[16..20].try_into().expect("slice is 4 bytes")),
            sequential_salt: i32::from_be_bytes(buf[20..24].try_into().expect("slice is 4 bytes")),
            checksum: u64::from_be_bytes(buf[24..32].try_into().expect("slice is 8 bytes")),
        };

        if header.magic != WAL_MAGIC {
            return Err(LuxdbError::corrupt_wal(format!(
                "invalid WAL magic: {:#010x}",
                header.magic
            )));
        }
        if !header.is_valid() {
            return Err(LuxdbError::corrupt_wal("invalid WAL header checksum"));
        }

        Ok(header)
    }

    /// Serializes this header into its 32-byte big-endian form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; WAL_HEADER_BYTES] {
        let mut buf = [0_u8; WAL_HEADER_BYTES];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..12].copy_from_slice(&self.db_size.to_be_bytes());
        buf[12..16].copy_from_slice(&self.checkpoint_sequence.to_be_bytes());
        buf[16..20].copy_from_slice(&self.random_salt.to_be_bytes());
        buf[20..24].copy_from_slice(&self.sequential_salt.to_be_bytes());
        buf[24..32].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    /// Whether the stored checksum matches the header fields.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.checksum
            == compute_checksum(
                self.magic,
                self.db_size,
                self.checkpoint_sequence,
                self.random_salt,
                self.sequential_salt,
            )
    }

    /// The header magic.
    #[must_use]
    pub fn magic(&self) -> i32 {
        self.magic
    }

    /// The database size in pages at the last commit.
    #[must_use]
    pub fn db_size(&self) -> i64 {
        self.db_size
    }

    /// The number of completed checkpoints.
    #[must_use]
    pub fn checkpoint_sequence(&self) -> i32 {
        self.checkpoint_sequence
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

    /// The header checksum.
    #[must_use]
    pub fn checksum(&self) -> u64 {
        self.checksum
    }
}

/// The FNV-1a hash of the first 24 serialized header bytes.
fn compute_checksum(
    magic: i32,
    db_size: i64,
    checkpoint_sequence: i32,
    random_salt: i32,
    sequential_salt: i32,
) -> u64 {
    Fnv1a::new()
        .mix_i32(magic)
        .mix_i64(db_size)
        .mix_i32(checkpoint_sequence)
        .mix_i32(random_salt)
        .mix_i32(sequential_salt)
        .state()
}
