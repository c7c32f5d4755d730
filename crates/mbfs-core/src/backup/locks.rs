//! Per-entry serialization.
//!
//! Operations that touch one entry's contents or metadata (reads, writes,
//! truncation, the close-time metadata refresh) hold that entry's mutex for
//! their duration. Operations on different entries proceed in parallel.
//!
//! # Lock ordering
//!
//! 1. An entry mutex may be held while taking the manifest state lock.
//! 2. The manifest state lock is never held while waiting for an entry mutex.
//! 3. No operation holds two entry mutexes at once.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

use super::manifest::EntryId;

/// Owned guard over one entry's mutex.
pub type EntryGuard = ArcMutexGuard<RawMutex, ()>;

/// Lazily populated table of per-entry mutexes.
#[derive(Debug, Default)]
pub struct EntryLockTable {
    locks: DashMap<EntryId, Arc<Mutex<()>>>,
}

impl EntryLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the mutex for `id`.
    pub fn entry_lock(&self, id: EntryId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Block until `id` is free and return an owned guard.
    pub fn lock(&self, id: EntryId) -> EntryGuard {
        self.entry_lock(id).lock_arc()
    }

    /// Forget the mutex of a removed entry. Holders of the `Arc` keep it alive.
    pub fn remove(&self, id: EntryId) {
        self.locks.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_same_id_same_lock() {
        let table = EntryLockTable::new();
        let a = table.entry_lock(EntryId(3));
        let b = table.entry_lock(EntryId(3));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &table.entry_lock(EntryId(4))));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_forgets_lock() {
        let table = EntryLockTable::new();
        let a = table.entry_lock(EntryId(1));
        table.remove(EntryId(1));
        assert!(table.is_empty());
        assert!(!Arc::ptr_eq(&a, &table.entry_lock(EntryId(1))));
    }

    #[test]
    fn test_lock_serializes_holders() {
        let table = Arc::new(EntryLockTable::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = table.lock(EntryId(0));
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
