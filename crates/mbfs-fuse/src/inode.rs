//! Inode management for the FUSE filesystem.
//!
//! FUSE addresses nodes by inode number while the bridge addresses them by
//! [`EntryKey`]. This table keeps the two in step, with the kernel's lookup
//! count deciding when a mapping can be dropped.
//!
//! Inode numbers here are independent of the inode field recorded in the
//! manifest: implicit directories have no record, and recorded numbers are
//! not guaranteed unique.

use dashmap::DashMap;
use mbfs_core::EntryKey;
use std::sync::atomic::{AtomicU64, Ordering};

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// An entry in the inode table.
#[derive(Debug)]
pub struct InodeEntry {
    /// The node this inode currently names.
    pub key: EntryKey,
    /// Lookup count for proper `forget()` handling.
    nlookup: AtomicU64,
}

impl InodeEntry {
    fn new(key: EntryKey, nlookup: u64) -> Self {
        Self {
            key,
            nlookup: AtomicU64::new(nlookup),
        }
    }

    /// Increments the lookup count and returns the new value.
    pub fn inc_nlookup(&self) -> u64 {
        self.nlookup.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrements the lookup count by `count`. Returns `None` if the count
    /// would go negative.
    pub fn dec_nlookup(&self, count: u64) -> Option<u64> {
        let old = self.nlookup.fetch_sub(count, Ordering::AcqRel);
        if old < count {
            self.nlookup.fetch_add(count, Ordering::Relaxed);
            None
        } else {
            Some(old - count)
        }
    }

    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::Relaxed)
    }
}

/// Thread-safe bidirectional map between inode numbers and entry keys.
///
/// Lock order: a `by_key` shard before a `by_inode` shard.
#[derive(Debug)]
pub struct InodeTable {
    by_inode: DashMap<u64, InodeEntry>,
    by_key: DashMap<EntryKey, u64>,
    next: AtomicU64,
}

impl InodeTable {
    /// Creates a new inode table with the archive root pre-allocated.
    pub fn new() -> Self {
        let table = Self {
            by_inode: DashMap::new(),
            by_key: DashMap::new(),
            next: AtomicU64::new(ROOT_INODE + 1),
        };
        table
            .by_inode
            .insert(ROOT_INODE, InodeEntry::new(EntryKey::root(), 1));
        table.by_key.insert(EntryKey::root(), ROOT_INODE);
        table
    }

    fn insert_with(&self, key: &EntryKey, nlookup: u64) -> u64 {
        *self.by_key.entry(key.clone()).or_insert_with(|| {
            let inode = self.next.fetch_add(1, Ordering::Relaxed);
            self.by_inode
                .insert(inode, InodeEntry::new(key.clone(), nlookup));
            inode
        })
    }

    /// Returns the inode for `key`, allocating one if needed, and counts one
    /// kernel lookup.
    ///
    /// Used for replies to `lookup`, `create`, `mkdir` and `symlink`.
    pub fn get_or_insert(&self, key: &EntryKey) -> u64 {
        if let Some(inode) = self.get_inode(key) {
            if let Some(entry) = self.by_inode.get(&inode) {
                entry.inc_nlookup();
            }
            return inode;
        }
        self.insert_with(key, 1)
    }

    /// Returns the inode for `key` without touching its lookup count.
    ///
    /// `readdir` replies must not count as lookups.
    pub fn get_or_insert_no_lookup_inc(&self, key: &EntryKey) -> u64 {
        if let Some(inode) = self.get_inode(key) {
            return inode;
        }
        self.insert_with(key, 0)
    }

    /// Key currently named by `inode`.
    pub fn key(&self, inode: u64) -> Option<EntryKey> {
        self.by_inode.get(&inode).map(|e| e.key.clone())
    }

    pub fn get_inode(&self, key: &EntryKey) -> Option<u64> {
        self.by_key.get(key).map(|i| *i)
    }

    pub fn nlookup(&self, inode: u64) -> Option<u64> {
        self.by_inode.get(&inode).map(|e| e.nlookup())
    }

    /// Drops `nlookup` kernel references. Returns `true` if the inode was
    /// evicted. The root is never evicted.
    pub fn forget(&self, inode: u64, nlookup: u64) -> bool {
        if inode == ROOT_INODE {
            return false;
        }
        let Some(entry) = self.by_inode.get(&inode) else {
            return false;
        };
        let Some(0) = entry.dec_nlookup(nlookup) else {
            return false;
        };
        let key = entry.key.clone();
        drop(entry);

        self.by_key.remove_if(&key, |_, mapped| *mapped == inode);
        self.by_inode.remove(&inode).is_some()
    }

    /// Unmaps `key` after the node was deleted.
    ///
    /// The inode entry stays until the kernel forgets it, since the kernel
    /// may still pass the number to later calls.
    pub fn invalidate_key(&self, key: &EntryKey) {
        self.by_key.remove(key);
    }

    /// Re-point every mapped key at or below `from` to the same place below
    /// `to`, after a rename. A mapping already at `to` is dropped first.
    pub fn rename_subtree(&self, from: &EntryKey, to: &EntryKey) {
        let stale: Vec<EntryKey> = self
            .by_key
            .iter()
            .filter(|e| e.key() == to || e.key().is_descendant_of(to))
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            self.invalidate_key(&key);
        }

        let moving: Vec<(EntryKey, u64)> = self
            .by_key
            .iter()
            .filter(|e| e.key() == from || e.key().is_descendant_of(from))
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        for (old, inode) in moving {
            let Some(Ok(new)) = old.rebase(from, to) else {
                continue;
            };
            self.by_key.remove(&old);
            self.by_key.insert(new.clone(), inode);
            if let Some(mut entry) = self.by_inode.get_mut(&inode) {
                entry.key = new;
            }
        }
    }

    /// Returns the number of inodes currently in the table.
    pub fn len(&self) -> usize {
        self.by_inode.len()
    }

    /// Returns true if the table only contains the root inode.
    pub fn is_empty(&self) -> bool {
        self.by_inode.len() <= 1
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(domain: &str, path: &str) -> EntryKey {
        EntryKey::new(domain, path).unwrap()
    }

    #[test]
    fn test_root_inode_exists() {
        let table = InodeTable::new();
        assert_eq!(table.key(ROOT_INODE), Some(EntryKey::root()));
        assert_eq!(table.get_inode(&EntryKey::root()), Some(ROOT_INODE));
        assert!(table.is_empty());
    }

    #[test]
    fn test_allocate_inode() {
        let table = InodeTable::new();
        let docs = key("HomeDomain", "Documents");

        let inode = table.get_or_insert(&docs);
        assert!(inode > ROOT_INODE);
        assert_eq!(table.get_or_insert(&docs), inode);
        assert_eq!(table.nlookup(inode), Some(2));
        assert_eq!(table.key(inode), Some(docs));
    }

    #[test]
    fn test_readdir_entries_do_not_count() {
        let table = InodeTable::new();
        let k = key("HomeDomain", "a.txt");
        let inode = table.get_or_insert_no_lookup_inc(&k);
        assert_eq!(table.nlookup(inode), Some(0));
        assert_eq!(table.get_or_insert(&k), inode);
        assert_eq!(table.nlookup(inode), Some(1));
    }

    #[test]
    fn test_forget_evicts() {
        let table = InodeTable::new();
        let k = key("HomeDomain", "temp");
        let inode = table.get_or_insert(&k);
        table.get_or_insert(&k);

        assert!(!table.forget(inode, 1));
        assert!(table.forget(inode, 1));
        assert!(table.key(inode).is_none());
        assert!(table.get_inode(&k).is_none());
    }

    #[test]
    fn test_forget_root_never_evicts() {
        let table = InodeTable::new();
        assert!(!table.forget(ROOT_INODE, 1));
        assert!(table.key(ROOT_INODE).is_some());
    }

    #[test]
    fn test_forget_does_not_unmap_reused_key() {
        let table = InodeTable::new();
        let k = key("HomeDomain", "a.txt");
        let old = table.get_or_insert(&k);
        table.invalidate_key(&k);
        let new = table.get_or_insert(&k);
        assert_ne!(old, new);

        assert!(table.forget(old, 1));
        assert_eq!(table.get_inode(&k), Some(new));
    }

    #[test]
    fn test_invalidate_keeps_inode() {
        let table = InodeTable::new();
        let k = key("HomeDomain", "gone");
        let inode = table.get_or_insert(&k);
        table.invalidate_key(&k);
        assert!(table.get_inode(&k).is_none());
        assert_eq!(table.key(inode), Some(k));
    }

    #[test]
    fn test_rename_subtree() {
        let table = InodeTable::new();
        let dir = table.get_or_insert(&key("HomeDomain", "Library"));
        let file = table.get_or_insert(&key("HomeDomain", "Library/a.txt"));
        let other = table.get_or_insert(&key("HomeDomain", "LibraryOld"));
        let replaced = table.get_or_insert(&key("HomeDomain", "Archive"));

        table.rename_subtree(&key("HomeDomain", "Library"), &key("HomeDomain", "Archive"));

        assert_eq!(table.get_inode(&key("HomeDomain", "Archive")), Some(dir));
        assert_eq!(table.get_inode(&key("HomeDomain", "Archive/a.txt")), Some(file));
        assert_eq!(table.key(file), Some(key("HomeDomain", "Archive/a.txt")));
        assert!(table.get_inode(&key("HomeDomain", "Library")).is_none());
        // Siblings sharing a prefix are untouched.
        assert_eq!(table.get_inode(&key("HomeDomain", "LibraryOld")), Some(other));
        // The replaced node keeps its inode until forgotten.
        assert_eq!(table.key(replaced), Some(key("HomeDomain", "Archive")));
    }
}
