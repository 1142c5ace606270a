//! File I/O layer for the luxdb storage engine.
//!
//! This crate provides the pieces the WAL engine builds on:
//!
//! - [`DbFile`]: a file façade with positioned random I/O, shared memory
//!   mapping, advisory byte-range locks, and `fsync`.
//! - [`FileSerial`] / [`SerialRegistry`]: a process-global identity service
//!   that resolves paths to a unique filesystem serial so that all in-process
//!   handles to the same underlying file share the same mutexes.
//! - [`lock_all`] / [`unlock_all`]: deadlock-free multi-lock acquisition.
//! - [`SharedSegment`]: a memory-mapped window over a file region, visible to
//!   every process that maps the same file.
//! - [`Page`]: the fixed 4096-byte database page record.

mod file;
mod locks;
mod page;
mod rand;
mod serial;
mod shm;

pub use file::{DbFile, FileRangeLock, OpenFlags};
pub use locks::{lock_all, unlock_all, RwGuard};
pub use page::{Page, PAGE_BYTES};
pub use rand::{fill_random, random_i32};
pub use serial::{FileSerial, SerialRegistry};
pub use shm::SharedSegment;
