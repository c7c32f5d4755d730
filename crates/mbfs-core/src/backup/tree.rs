//! Directory tree over manifest entries.
//!
//! Every key is a path of segments from the archive root (domain first).
//! Nodes without an entry are implicit directories that exist only because
//! something below them does; they disappear with their last child.

use std::collections::BTreeMap;

use super::key::EntryKey;
use super::manifest::EntryId;

#[derive(Debug, Default)]
pub(crate) struct TreeNode {
    entry: Option<EntryId>,
    children: BTreeMap<String, TreeNode>,
}

/// A direct child of a tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TreeChild {
    pub name: String,
    pub entry: Option<EntryId>,
}

impl TreeNode {
    fn find(&self, key: &EntryKey) -> Option<&TreeNode> {
        let mut node = self;
        for segment in key.segments() {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    pub fn contains(&self, key: &EntryKey) -> bool {
        self.find(key).is_some()
    }

    pub fn entry_at(&self, key: &EntryKey) -> Option<EntryId> {
        self.find(key).and_then(|n| n.entry)
    }

    /// Attach `id` at `key`, creating implicit intermediate nodes.
    pub fn insert(&mut self, key: &EntryKey, id: EntryId) {
        let mut node = self;
        for segment in key.segments() {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.entry = Some(id);
    }

    /// Detach the entry at `key` and prune implicit nodes left without children.
    pub fn remove(&mut self, key: &EntryKey) -> Option<EntryId> {
        let segments: Vec<&str> = key.segments().collect();
        Self::remove_at(self, &segments)
    }

    fn remove_at(node: &mut TreeNode, segments: &[&str]) -> Option<EntryId> {
        let Some((first, rest)) = segments.split_first() else {
            return node.entry.take();
        };
        let child = node.children.get_mut(*first)?;
        let removed = Self::remove_at(child, rest);
        if child.entry.is_none() && child.children.is_empty() {
            node.children.remove(*first);
        }
        removed
    }

    /// Children of the node at `key`, or `None` if no such node exists.
    ///
    /// Children with an entry come first in `order` (entry id) order, then
    /// implicit directories by name.
    pub fn children(&self, key: &EntryKey) -> Option<Vec<TreeChild>> {
        let node = self.find(key)?;
        let mut real: Vec<TreeChild> = Vec::new();
        let mut implicit: Vec<TreeChild> = Vec::new();
        for (name, child) in &node.children {
            let item = TreeChild {
                name: name.clone(),
                entry: child.entry,
            };
            if child.entry.is_some() {
                real.push(item);
            } else {
                implicit.push(item);
            }
        }
        real.sort_by_key(|c| c.entry);
        real.extend(implicit);
        Some(real)
    }

    pub fn has_children(&self, key: &EntryKey) -> bool {
        self.find(key).is_some_and(|n| !n.children.is_empty())
    }

    /// Ids of every entry strictly below `key`, parents before children.
    pub fn descendants(&self, key: &EntryKey) -> Vec<EntryId> {
        let mut out = Vec::new();
        if let Some(node) = self.find(key) {
            let mut stack: Vec<&TreeNode> = node.children.values().rev().collect();
            while let Some(n) = stack.pop() {
                if let Some(id) = n.entry {
                    out.push(id);
                }
                stack.extend(n.children.values().rev());
            }
        }
        out
    }

    /// Names of the top-level nodes (domains), sorted.
    pub fn top_level_names(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(domain: &str, path: &str) -> EntryKey {
        EntryKey::new(domain, path).unwrap()
    }

    #[test]
    fn test_insert_creates_implicit_parents() {
        let mut tree = TreeNode::default();
        tree.insert(&key("D", "a/b/c"), EntryId(0));
        assert!(tree.contains(&key("D", "a/b")));
        assert_eq!(tree.entry_at(&key("D", "a/b")), None);
        assert_eq!(tree.entry_at(&key("D", "a/b/c")), Some(EntryId(0)));
        assert_eq!(tree.top_level_names(), ["D"]);
    }

    #[test]
    fn test_remove_prunes_empty_implicit_nodes() {
        let mut tree = TreeNode::default();
        tree.insert(&key("D", "a"), EntryId(0));
        tree.insert(&key("D", "a/b/c"), EntryId(1));
        assert_eq!(tree.remove(&key("D", "a/b/c")), Some(EntryId(1)));
        assert!(!tree.contains(&key("D", "a/b")));
        assert!(tree.contains(&key("D", "a")));
        assert_eq!(tree.remove(&key("D", "a")), Some(EntryId(0)));
        assert!(!tree.contains(&key("D", "")));
        assert_eq!(tree.remove(&key("D", "a")), None);
    }

    #[test]
    fn test_remove_keeps_node_with_children() {
        let mut tree = TreeNode::default();
        tree.insert(&key("D", "a"), EntryId(0));
        tree.insert(&key("D", "a/b"), EntryId(1));
        tree.remove(&key("D", "a"));
        assert!(tree.contains(&key("D", "a")));
        assert_eq!(tree.entry_at(&key("D", "a/b")), Some(EntryId(1)));
    }

    #[test]
    fn test_children_order() {
        let mut tree = TreeNode::default();
        tree.insert(&key("D", "z"), EntryId(0));
        tree.insert(&key("D", "a"), EntryId(2));
        tree.insert(&key("D", "m/x"), EntryId(1));
        let names: Vec<_> = tree
            .children(&key("D", ""))
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, ["z", "a", "m"]);
        assert!(tree.children(&key("E", "")).is_none());
    }

    #[test]
    fn test_descendants() {
        let mut tree = TreeNode::default();
        tree.insert(&key("D", "a"), EntryId(0));
        tree.insert(&key("D", "a/b/c"), EntryId(1));
        tree.insert(&key("D", "a/d"), EntryId(2));
        tree.insert(&key("D", "e"), EntryId(3));
        assert_eq!(
            tree.descendants(&key("D", "a")),
            [EntryId(1), EntryId(2)]
        );
        assert!(tree.has_children(&key("D", "a")));
        assert!(!tree.has_children(&key("D", "e")));
    }
}
