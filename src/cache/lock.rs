//! Lock helpers shared by the cache components.
//!
//! Standard locks guard short, synchronous critical sections and recover from
//! poisoning with a warning. `EntryLocks` serializes the async read-modify-write
//! sequences of one cache entry, which may await the backing store.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::warn;

use super::keys::{Fingerprint, hash_value};

fn report_poisoned(target: &'static str, op: &'static str, lock_kind: &'static str) {
    warn!(
        op,
        target_module = target,
        lock_kind,
        result = "poisoned_recovered",
        hint = "cached documents may be stale after a panic in another task",
        "Recovered from poisoned cache lock"
    );
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        report_poisoned(target, op, "rwlock.read");
        poisoned.into_inner()
    })
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        report_poisoned(target, op, "rwlock.write");
        poisoned.into_inner()
    })
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        report_poisoned(target, op, "mutex.lock");
        poisoned.into_inner()
    })
}

/// Striped async locks keyed by fingerprint.
///
/// Two fingerprints may share a stripe; that only costs concurrency. Holders
/// must never take a second stripe.
pub(crate) struct EntryLocks {
    stripes: Vec<AsyncMutex<()>>,
}

impl EntryLocks {
    pub(crate) fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| AsyncMutex::new(())).collect(),
        }
    }

    pub(crate) async fn lock(&self, fingerprint: &Fingerprint) -> AsyncMutexGuard<'_, ()> {
        let index = (hash_value(fingerprint) % self.stripes.len() as u64) as usize;
        self.stripes[index].lock().await
    }
}
