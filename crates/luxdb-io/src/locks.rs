//! Deadlock-free multi-lock helpers.
//!
//! [`lock_all`] obtains exclusive ownership of an arbitrary set of
//! reader/writer mutexes without risking deadlock against another thread
//! acquiring an overlapping set in a different order. The algorithm blocks on
//! one lock, try-acquires the rest in rotation, and on any failure releases
//! everything and restarts from the lock that was contended.

use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{RawRwLock, RwLock};

/// An owned exclusive guard over one of the registry's reader/writer mutexes.
pub type RwGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

/// Obtain exclusive ownership of all given locks while avoiding deadlocks.
///
/// After this function returns, the calling thread owns every lock in the
/// set. Ownership is represented by the returned guards; dropping them (or
/// passing them to [`unlock_all`]) releases the locks.
///
/// This blocks until all locks have been obtained.
#[must_use]
pub fn lock_all(locks: &[Arc<RwLock<()>>]) -> Vec<RwGuard> {
    if locks.is_empty() {
        return Vec::new();
    }

    let mut first = 0;
    loop {
        let mut acquired = Vec::with_capacity(locks.len());
        acquired.push(locks[first].write_arc());

        let mut contended = None;
        for j in 1..locks.len() {
            let idx = (first + j) % locks.len();
            match locks[idx].try_write_arc() {
                Some(guard) => acquired.push(guard),
                None => {
                    contended = Some(idx);
                    break;
                }
            }
        }

        match contended {
            None => return acquired,
            Some(idx) => {
                // Release everything acquired so far and retry, blocking on
                // the lock that was contended.
                drop(acquired);
                first = idx;
            }
        }
    }
}

/// Release exclusive ownership of all provided locks.
///
/// Guards only ever cover locks the caller actually owns, so this is a plain
/// drop of the guard set; locks not represented in `guards` are untouched.
pub fn unlock_all(guards: Vec<RwGuard>) {
    drop(guards);
}
