//! Table of open file handles keyed by the 64-bit ids handed to a mount
//! collaborator.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::one::{Ref, RefMut};

/// Thread-safe map from handle ids to open values.
///
/// Ids start at 1 and are never reused for the lifetime of the table, so a
/// stale id from the collaborator cannot reach a newer handle. 0 is left free
/// for collaborators that use it as "no handle".
#[derive(Debug)]
pub struct HandleTable<T> {
    handles: DashMap<u64, T>,
    next_id: AtomicU64,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Store `value` and return its new id.
    pub fn insert(&self, value: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(id, value);
        id
    }

    pub fn get(&self, id: u64) -> Option<Ref<'_, u64, T>> {
        self.handles.get(&id)
    }

    pub fn get_mut(&self, id: u64) -> Option<RefMut<'_, u64, T>> {
        self.handles.get_mut(&id)
    }

    pub fn remove(&self, id: u64) -> Option<T> {
        self.handles.remove(&id).map(|(_, value)| value)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Remove and return every value, in id order.
    pub fn drain(&self) -> Vec<(u64, T)> {
        let mut ids: Vec<u64> = self.handles.iter().map(|r| *r.key()).collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.handles.remove(&id))
            .collect()
    }
}
