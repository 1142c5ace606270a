use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for luxdb storage operations.
///
/// Every error that crosses a public API boundary is one of these variants;
/// internal `std::io::Error`s are translated into domain kinds at the edge of
/// the WAL engine. Variants are grouped by the recovery policy callers should
/// apply, and [`LuxdbError::is_transient`] lets clients drive retry loops
/// without inspecting the underlying cause.
#[derive(Error, Debug)]
pub enum LuxdbError {
    // === WAL integrity ===
    /// The WAL file failed a checksum, magic, or completeness check.
    #[error("WAL file is corrupt: {detail}")]
    CorruptWal { detail: String },

    /// A frame payload could not be read back in full.
    #[error("WAL page is corrupt: {detail}")]
    CorruptPage { detail: String },

    /// A page was requested at a frame index past the last commit frame.
    #[error("no WAL frame exists at index {frame}")]
    NoSuchPage { frame: i32 },

    // === Concurrency ===
    /// The index snapshot changed between the shared and exclusive lock
    /// acquisitions; the caller must restart from the read boundary.
    #[error("WAL contents changed since the read transaction started")]
    StaleWal,

    /// An exclusive lock was requested while no shared lock was held.
    #[error("out of order locking: an exclusive lock is requested, but no shared lock is currently held")]
    OutOfOrderLock,

    /// A file lock could not be acquired for a reason other than an interrupt.
    #[error("file locking failed: {detail}")]
    LockFailed { detail: String },

    /// Both index header copies differed while no exclusive lock was held.
    #[error("concurrent WAL index modification detected: {detail}")]
    ConcurrentModification { detail: String },

    /// WAL creation was attempted while another thread holds the one-shot
    /// initializer lock.
    #[error("cannot obtain the WAL initializer lock")]
    InitLockBusy,

    // === Handle lifecycle ===
    /// A blocking operation was interrupted and the underlying descriptor was
    /// invalidated; the handle must be reopened before further use.
    #[error("file closed by an interrupt: '{path}'")]
    ClosedByInterrupt { path: PathBuf },

    /// The underlying file was closed by another thread sharing the handle.
    #[error("file is closed: '{path}'")]
    FileClosed { path: PathBuf },

    // === Writes ===
    /// A non-deterministic I/O failure during an append; safe to retry.
    #[error("transient WAL write failure: {detail}")]
    WriteTransient { detail: String },

    /// An unrecoverable write failure; the caller must not retry.
    #[error("fatal WAL write failure: {detail}")]
    WriteFatal { detail: String },

    // === Frame table ===
    /// The frame table grow path re-entered itself; the pre-grow capacity and
    /// size have been restored.
    #[error("frame table grown recursively; reverted to pre-grow state")]
    RecursiveGrow,

    /// An arithmetic operation overflowed its integer type.
    #[error("integer overflow")]
    IntegerOverflow,

    // === General ===
    /// An argument was outside its permitted range.
    #[error("{what} out of range: {value}")]
    OutOfRange { what: &'static str, value: i64 },

    /// The requested operation exists in the design but has no implementation.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// An untranslated I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LuxdbError {
    /// Whether this error may succeed when the operation is retried.
    ///
    /// Stale and concurrent-modification errors are retryable from the read
    /// transaction boundary; lock and transient-write failures are retryable
    /// in place.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StaleWal
                | Self::LockFailed { .. }
                | Self::ConcurrentModification { .. }
                | Self::InitLockBusy
                | Self::FileClosed { .. }
                | Self::WriteTransient { .. }
        )
    }

    /// Whether the file handle must be reopened before it can be used again.
    #[must_use]
    pub const fn requires_reopen(&self) -> bool {
        matches!(self, Self::ClosedByInterrupt { .. })
    }

    /// Create a corrupt-WAL error.
    pub fn corrupt_wal(detail: impl Into<String>) -> Self {
        Self::CorruptWal {
            detail: detail.into(),
        }
    }

    /// Create a corrupt-page error.
    pub fn corrupt_page(detail: impl Into<String>) -> Self {
        Self::CorruptPage {
            detail: detail.into(),
        }
    }

    /// Create a lock-failed error.
    pub fn lock_failed(detail: impl Into<String>) -> Self {
        Self::LockFailed {
            detail: detail.into(),
        }
    }

    /// Create a concurrent-modification error.
    pub fn concurrent_modification(detail: impl Into<String>) -> Self {
        Self::ConcurrentModification {
            detail: detail.into(),
        }
    }

    /// Create a transient write error.
    pub fn write_transient(detail: impl Into<String>) -> Self {
        Self::WriteTransient {
            detail: detail.into(),
        }
    }

    /// Create a fatal write error.
    pub fn write_fatal(detail: impl Into<String>) -> Self {
        Self::WriteFatal {
            detail: detail.into(),
        }
    }

    /// Create a not-implemented error.
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented(feature.into())
    }
}

/// Result type alias using `LuxdbError`.
pub type Result<T> = std::result::Result<T, LuxdbError>;
