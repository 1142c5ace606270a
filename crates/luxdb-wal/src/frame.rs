//! WAL frames.
//!
//! A frame is one fixed-size, append-only record of a single revised
//! database page: a 32-byte header followed by the 4096-byte page image.
//!
//! ```text
//! Offset  Size  Field
//!   0       8   pageIndex (>= 1)
//!   8       1   commit (1 iff this frame completes a transaction)
//!   9       4   randomSalt (copy of the WAL header's randomSalt)
//!  13       4   sequentialSalt (copy of the WAL header's sequentialSalt)
//!  17       8   checksum (cumulative, seeded with the previous frame's)
//!  25       7   padding
//!  32    4096   page image
//! ```
//!
//! A frame is valid iff its salts match the current WAL header salts and its
//! checksum equals the recomputed cumulative value. Frames with mismatched
//! salts are remnants from before the last checkpoint.

use luxdb_error::{LuxdbError, Result};
use luxdb_io::PAGE_BYTES;

use crate::fnv::Fnv1a;

/// The byte size of a serialized frame header.
pub const FRAME_HEADER_BYTES: usize = 32;

/// The byte size of a serialized frame.
pub const FRAME_BYTES: usize = FRAME_HEADER_BYTES + PAGE_BYTES;

/// A record of a single revised database page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFrame {
    page_index: i64,
    commit: bool,
    random_salt: i32,
    sequential_salt: i32,
    checksum: u64,
    page: Vec<u8>,
}

impl WalFrame {
    /// Builds a frame for `page`, chaining its checksum onto `checksum_seed`
    /// (the cumulative checksum of the preceding frame, or the empty hash
    /// state for frame 0).
    pub fn build(
        page_index: i64,
        commit: bool,
        random_salt: i32,
        sequential_salt: i32,
        page: &[u8],
        checksum_seed: u64,
    ) -> Result<Self> {
        if page_index < 1 {
            return Err(LuxdbError::OutOfRange {
                what: "page index",
                value: page_index,
            });
        }
        if page.len() != PAGE_BYTES {
            return Err(LuxdbError::OutOfRange {
                what: "page length",
                value: i64::try_from(page.len()).unwrap_or(i64::MAX),
            });
        }

        let checksum = chain_checksum(
            checksum_seed,
            page_index,
            commit,
            random_salt,
            sequential_salt,
            page,
        );
        Ok(Self {
            page_index,
            commit,
            random_salt,
            sequential_salt,
            checksum,
            page: page.to_vec(),
        })
    }

    /// Parses a frame from a complete [`FRAME_BYTES`] buffer as read from the
    /// WAL file. The stored checksum is taken as-is; chain validation happens
    /// against the index, not here.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != FRAME_BYTES {
            return Err(LuxdbError::corrupt_wal(format!(
                "frame buffer must contain exactly {FRAME_BYTES} bytes, got {}",
                buf.len()
            )));
        }

        let page_index = i64::from_be_bytes(buf[0..8].try_into().expect("slice is 8 bytes"));
        if page_index < 1 {
            return Err(LuxdbError::corrupt_wal(format!(
                "frame page index must be >= 1, got {page_index}"
            )));
        }

        Ok(Self {
            page_index,
            commit: buf[8] == 1,
            random_salt: i32::from_be_bytes(buf[9..13].try_into().expect("slice is 4 bytes")),
            sequential_salt: i32::from_be_bytes(buf[13..17].try_into().expect("slice is 4 bytes")),
            checksum: u64::from_be_bytes(buf[17..25].try_into().expect("slice is 8 bytes")),
            page: buf[FRAME_HEADER_BYTES..].to_vec(),
        })
    }

    /// Serializes the 32-byte frame header.
    #[must_use]
    pub fn header_bytes(&self) -> [u8; FRAME_HEADER_BYTES] {
        let mut buf = [0_u8; FRAME_HEADER_BYTES];
        buf[0..8].copy_from_slice(&self.page_index.to_be_bytes());
        buf[8] = u8::from(self.commit);
        buf[9..13].copy_from_slice(&self.random_salt.to_be_bytes());
        buf[13..17].copy_from_slice(&self.sequential_salt.to_be_bytes());
        buf[17..25].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    /// The page number this frame writes to.
    #[must_use]
    pub fn page_index(&self) -> i64 {
        self.page_index
    }

    /// Whether this frame completes a transaction.
    #[must_use]
    pub fn is_commit(&self) -> bool {
        self.commit
    }

    /// The random salt copied from the WAL header at frame creation.
    #[must_use]
    pub fn random_salt(&self) -> i32 {
        self.random_salt
    }

    /// The sequential salt copied from the WAL header at frame creation.
    #[must_use]
    pub fn sequential_salt(&self) -> i32 {
        self.sequential_salt
    }

    /// The cumulative checksum including all prior frames and this frame.
    #[must_use]
    pub fn checksum(&self) -> u64 {
        self.checksum
    }

    /// The page image.
    #[must_use]
    pub fn page(&self) -> &[u8] {
        &self.page
    }
}

/// Chains the cumulative frame checksum: the hash is seeded with the previous
/// frame's checksum and mixed over this frame's fields and page bytes.
pub fn chain_checksum(
    seed: u64,
    page_index: i64,
    commit: bool,
    random_salt: i32,
    sequential_salt: i32,
    page: &[u8],
) -> u64 {
    Fnv1a::seeded(seed)
        .mix_i64(page_index)
        .mix_bool(commit)
        .mix_i32(random_salt)
        .mix_i32(sequential_salt)
        .mix_bytes(page)
        .state()
}
