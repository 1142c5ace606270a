//! Per-file identity registry.
//!
//! POSIX advisory locks and in-process mutexes must be coordinated per
//! *filesystem object*, not per path: two handles opened through different
//! paths to the same inode must share the same synchronization objects. A
//! [`FileSerial`] is that identity. All serials live in a process-global,
//! doubly linked collection that is searched backwards from the tail, because
//! the most recently created serial has the highest chance of reuse.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use luxdb_error::Result;

use crate::locks::lock_all;

/// The unique identifying key of a filesystem object.
///
/// On filesystems that expose a stable file key this is the `(device, inode)`
/// pair; otherwise the canonicalized path string stands in for it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SerialKey {
    Inode { dev: u64, ino: u64 },
    Path(PathBuf),
}

impl SerialKey {
    fn of(path: &Path) -> Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if let Ok(meta) = fs::metadata(path) {
                return Ok(Self::Inode {
                    dev: meta.dev(),
                    ino: meta.ino(),
                });
            }
        }

        debug!(
            path = %path.display(),
            "filesystem provides no unique file serial; using real path as fallback"
        );
        Ok(Self::Path(fs::canonicalize(path)?))
    }
}

/// How many in-process handles hold a byte-range lock on one lock slot.
///
/// POSIX advisory locks are per-process: any handle releasing a range drops
/// the process's lock on it, even while another handle still needs it. The
/// OS-level lock is therefore only taken by the first holder and only
/// released by the last.
#[derive(Debug, Default)]
pub(crate) struct RangeLockState {
    pub(crate) shared: u32,
    pub(crate) exclusive: u32,
}

/// The intrusive links of a serial within the global collection.
struct Links {
    /// The previous serial, towards the head. Strong so traversal from the
    /// tail keeps the chain alive.
    prev: Option<Arc<FileSerial>>,
    /// The next serial, towards the tail. Weak to avoid a reference cycle.
    next: Option<Weak<FileSerial>>,
}

/// A unique identification of a file within its filesystem.
///
/// Every in-process handle to the same underlying file shares the same
/// `FileSerial`, and therefore the same [`mutex`](Self::mutex) and
/// [`exclusive_mutex`](Self::exclusive_mutex). The reader/writer mutex
/// coordinates shared/exclusive access within the process; the plain mutex
/// guards the cross-process exclusive upgrade.
pub struct FileSerial {
    key: SerialKey,
    mutex: Arc<RwLock<()>>,
    exclusive: Arc<Mutex<()>>,
    refs: AtomicUsize,
    links: Mutex<Links>,
    range_locks: Mutex<HashMap<u64, RangeLockState>>,
}

impl FileSerial {
    fn new(key: SerialKey, prev: Option<Arc<FileSerial>>) -> Self {
        Self {
            key,
            mutex: Arc::new(RwLock::new(())),
            exclusive: Arc::new(Mutex::new(())),
            refs: AtomicUsize::new(1),
            links: Mutex::new(Links { prev, next: None }),
            range_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The per-offset byte-range lock refcounts shared by all handles to
    /// this file.
    pub(crate) fn range_locks(&self) -> &Mutex<HashMap<u64, RangeLockState>> {
        &self.range_locks
    }

    /// The mutex coordinating readers and writers of the handles that
    /// reference this serial. This is not a lock on the serial itself.
    #[must_use]
    pub fn mutex(&self) -> Arc<RwLock<()>> {
        Arc::clone(&self.mutex)
    }

    /// The mutex serializing exclusive-mode upgrades across the handles that
    /// reference this serial.
    #[must_use]
    pub fn exclusive_mutex(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.exclusive)
    }

    /// The number of handles referencing this serial in the current process.
    #[must_use]
    pub fn reference_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for FileSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSerial")
            .field("refs", &self.reference_count())
            .field("serial", &self.key)
            .finish()
    }
}

/// The process-global collection of referenced [`FileSerial`]s.
///
/// Structural changes (insert, unlink) require the exclusive side of the
/// global guard; traversal takes the shared side. Obtain the singleton via
/// [`SerialRegistry::global`].
pub struct SerialRegistry {
    /// Guards structural changes to the linked collection.
    guard: RwLock<()>,
    /// The most recently created serial.
    tail: Mutex<Option<Arc<FileSerial>>>,
}

impl SerialRegistry {
    fn new() -> Self {
        Self {
            guard: RwLock::new(()),
            tail: Mutex::new(None),
        }
    }

    /// The singleton registry for this process.
    pub fn global() -> &'static SerialRegistry {
        static REGISTRY: OnceLock<SerialRegistry> = OnceLock::new();
        REGISTRY.get_or_init(SerialRegistry::new)
    }

    /// Obtains the unique serial of the given path. Multiple paths leading to
    /// the same filesystem object yield the same [`FileSerial`] instance.
    pub fn find(&self, path: &Path) -> Result<Arc<FileSerial>> {
        let key = SerialKey::of(path)?;

        // Prevent structural changes while traversing the collection.
        {
            let _shared = self.guard.read();
            if let Some(serial) = self.search(&key) {
                serial.refs.fetch_add(1, Ordering::SeqCst);
                return Ok(serial);
            }
        }

        trace!(?key, path = %path.display(), "file serial not yet referenced; creating new reference");

        let _exclusive = self.guard.write();

        // Another thread may have inserted the same serial between dropping
        // the shared guard and obtaining the exclusive one.
        if let Some(serial) = self.search(&key) {
            serial.refs.fetch_add(1, Ordering::SeqCst);
            return Ok(serial);
        }

        let mut tail = self.tail.lock();
        let serial = Arc::new(FileSerial::new(key, tail.clone()));
        if let Some(old_tail) = tail.as_ref() {
            old_tail.links.lock().next = Some(Arc::downgrade(&serial));
        }
        *tail = Some(Arc::clone(&serial));

        Ok(serial)
    }

    /// Decrements the reference count of `serial` and unlinks it from the
    /// collection when no references remain.
    pub fn release(&self, serial: &Arc<FileSerial>) {
        if serial.refs.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }

        trace!(serial = ?serial.key, "file serial has no more references; unlinking it");

        // Unlinking is a structural change.
        let _exclusive = self.guard.write();

        // A concurrent find() may have resurrected the serial before we got
        // the exclusive guard.
        if serial.refs.load(Ordering::SeqCst) != 0 {
            return;
        }

        let (prev, next) = {
            let links = serial.links.lock();
            (links.prev.clone(), links.next.as_ref().and_then(Weak::upgrade))
        };

        match (prev, next) {
            (Some(prev), Some(next)) => {
                // Both neighbors get relinked; take exclusive ownership of
                // their mutexes in a deadlock-free order before swinging the
                // links.
                let guards = lock_all(&[prev.mutex(), next.mutex()]);
                prev.links.lock().next = Some(Arc::downgrade(&next));
                next.links.lock().prev = Some(Arc::clone(&prev));
                drop(guards);
            }
            (Some(prev), None) => {
                prev.links.lock().next = None;
            }
            (None, Some(next)) => {
                next.links.lock().prev = None;
            }
            (None, None) => {}
        }

        let mut tail = self.tail.lock();
        if tail.as_ref().is_some_and(|t| Arc::ptr_eq(t, serial)) {
            *tail = serial.links.lock().prev.clone();
        }
    }

    /// Searches the collection from tail to head for a serial with `key`.
    /// Callers must hold at least the shared side of the global guard.
    fn search(&self, key: &SerialKey) -> Option<Arc<FileSerial>> {
        let mut cursor = self.tail.lock().clone();
        while let Some(serial) = cursor {
            if serial.key == *key {
                return Some(serial);
            }
            cursor = serial.links.lock().prev.clone();
        }
        None
    }
}
