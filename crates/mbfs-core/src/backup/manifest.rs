//! The in-memory manifest: ordered entries, a key index and a directory tree.
//!
//! Entries live in a slot arena. An [`EntryId`] is the slot index, so it
//! stays valid when an entry is re-keyed and keeps the entry's position in
//! the serialized record stream. Removing an entry empties its slot; slots
//! are never reused.
//!
//! # Thread Safety
//!
//! All state sits behind one `RwLock`. Lookups share it, mutations and
//! [`Manifest::flush_changes`] hold it exclusively, so no caller ever sees
//! the collection, the index and the tree disagree.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use super::config::ManifestOptions;
use super::entry::Entry;
use super::handle::EntryHandle;
use super::key::{EntryKey, KeyError};
use super::locks::EntryLockTable;
use super::tree::TreeNode;

/// Stable identifier of an entry for the lifetime of a [`Manifest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) usize);

impl EntryId {
    /// Position of the entry's record in the manifest's slot order.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Context for manifest I/O errors.
#[derive(Debug, Clone, Default)]
pub struct ManifestContext {
    /// The file being read or written
    pub path: Option<PathBuf>,
    pub key: Option<EntryKey>,
    pub operation: Option<&'static str>,
}

impl ManifestContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_key(mut self, key: EntryKey) -> Self {
        self.key = Some(key);
        self
    }

    #[must_use]
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        self.operation = Some(operation);
        self
    }
}

impl fmt::Display for ManifestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(op) = self.operation {
            parts.push(format!("during {op}"));
        }
        if let Some(ref key) = self.key {
            parts.push(format!("entry {key}"));
        }
        if let Some(ref path) = self.path {
            parts.push(format!("at {:?}", path.display()));
        }
        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Corrupt manifest at byte {offset}: {reason}")]
    CorruptManifest { offset: usize, reason: String },

    #[error("Unsupported manifest version {version} (supported: {supported:?})")]
    UnsupportedVersion { version: u8, supported: Vec<u8> },

    #[error("An entry already exists for {key}")]
    DuplicateKey { key: EntryKey },

    #[error("No entry for {key}")]
    NotFound { key: EntryKey },

    #[error("{key} is not a directory")]
    NotADirectory { key: EntryKey },

    #[error("Entry {key} cannot be encoded: {reason}")]
    Unencodable { key: EntryKey, reason: String },

    #[error(transparent)]
    InvalidIdentity(#[from] KeyError),

    #[error("Failed to write manifest {context}: {source}")]
    WriteFailed {
        #[source]
        source: io::Error,
        context: ManifestContext,
    },

    #[error("IO error {context}: {source}")]
    Io {
        #[source]
        source: io::Error,
        context: ManifestContext,
    },
}

/// One child of a directory as seen by a listing.
#[derive(Debug, Clone)]
pub struct DirectoryChild {
    pub name: String,
    pub key: EntryKey,
    /// `None` for an implicit directory that only exists through its children.
    pub entry: Option<Entry>,
}

impl DirectoryChild {
    pub fn is_implicit(&self) -> bool {
        self.entry.is_none()
    }

    pub fn is_directory(&self) -> bool {
        self.entry.as_ref().is_none_or(Entry::is_directory)
    }
}

#[derive(Debug, Default)]
struct ManifestState {
    slots: Vec<Option<Entry>>,
    index: HashMap<EntryKey, EntryId>,
    tree: TreeNode,
    next_inode: u64,
    dirty: bool,
}

impl ManifestState {
    fn get(&self, id: EntryId) -> Option<&Entry> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    fn lookup(&self, key: &EntryKey) -> Option<&Entry> {
        self.index.get(key).and_then(|id| self.get(*id))
    }

    fn insert(&mut self, entry: Entry) -> EntryId {
        let id = EntryId(self.slots.len());
        self.index.insert(entry.key().clone(), id);
        self.tree.insert(entry.key(), id);
        self.next_inode = self.next_inode.max(entry.inode.saturating_add(1));
        self.slots.push(Some(entry));
        id
    }

    /// Re-key the entry in slot `id`. The caller has checked `to` is free.
    fn rekey(&mut self, id: EntryId, to: EntryKey) {
        let Some(entry) = self.slots.get_mut(id.0).and_then(Option::as_mut) else {
            return;
        };
        let from = entry.key().clone();
        entry.set_key(to.clone());
        self.index.remove(&from);
        self.tree.remove(&from);
        self.index.insert(to.clone(), id);
        self.tree.insert(&to, id);
    }

    fn ensure_directory(&self, key: &EntryKey) -> Result<(), ManifestError> {
        match self.lookup(key) {
            Some(entry) if !entry.is_directory() => Err(ManifestError::NotADirectory {
                key: key.clone(),
            }),
            Some(_) => Ok(()),
            None if key.is_root() || self.tree.contains(key) => Ok(()),
            None => Err(ManifestError::NotFound { key: key.clone() }),
        }
    }
}

struct ManifestShared {
    archive_dir: PathBuf,
    options: ManifestOptions,
    version: u8,
    state: RwLock<ManifestState>,
    locks: EntryLockTable,
}

/// A loaded manifest. Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct Manifest {
    shared: Arc<ManifestShared>,
}

impl fmt::Debug for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manifest")
            .field("archive_dir", &self.shared.archive_dir)
            .field("version", &self.shared.version)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl Manifest {
    /// Load the manifest of the archive at `archive_dir` with default options.
    pub fn load(archive_dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        Self::load_with_options(archive_dir, ManifestOptions::default())
    }

    #[instrument(level = "debug", skip(archive_dir, options), fields(archive = %archive_dir.as_ref().display()))]
    pub fn load_with_options(
        archive_dir: impl AsRef<Path>,
        options: ManifestOptions,
    ) -> Result<Self, ManifestError> {
        let archive_dir = archive_dir.as_ref().to_path_buf();
        let path = archive_dir.join(&options.manifest_file_name);
        let data = std::fs::read(&path).map_err(|source| ManifestError::Io {
            source,
            context: ManifestContext::new()
                .with_path(&path)
                .with_operation("load"),
        })?;

        let decoded = options.format.decode(&data).inspect_err(|e| {
            warn!(path = %path.display(), error = %e, "Rejecting manifest");
        })?;

        let mut state = ManifestState {
            next_inode: 1,
            ..ManifestState::default()
        };
        for (entry, offset) in decoded.entries.into_iter().zip(decoded.record_offsets) {
            if state.index.contains_key(entry.key()) {
                warn!(key = %entry.key(), offset, "Duplicate record in manifest");
                return Err(ManifestError::CorruptManifest {
                    offset,
                    reason: format!("duplicate record for {}", entry.key()),
                });
            }
            state.insert(entry);
        }

        debug!(
            path = %path.display(),
            version = decoded.version,
            entries = state.index.len(),
            "Loaded manifest"
        );
        Ok(Self::from_parts(archive_dir, options, decoded.version, state))
    }

    /// Start an empty manifest for `archive_dir` and write it out.
    ///
    /// Fails with [`ManifestError::Io`] if a manifest file already exists.
    #[instrument(level = "debug", skip(archive_dir, options), fields(archive = %archive_dir.as_ref().display()))]
    pub fn create(
        archive_dir: impl AsRef<Path>,
        options: ManifestOptions,
    ) -> Result<Self, ManifestError> {
        let archive_dir = archive_dir.as_ref().to_path_buf();
        let path = archive_dir.join(&options.manifest_file_name);
        if path.exists() {
            return Err(ManifestError::Io {
                source: io::Error::from(io::ErrorKind::AlreadyExists),
                context: ManifestContext::new()
                    .with_path(&path)
                    .with_operation("create"),
            });
        }
        let version = options.format.version;
        let state = ManifestState {
            next_inode: 1,
            ..ManifestState::default()
        };
        let manifest = Self::from_parts(archive_dir, options, version, state);
        manifest.flush_changes()?;
        Ok(manifest)
    }

    fn from_parts(
        archive_dir: PathBuf,
        options: ManifestOptions,
        version: u8,
        state: ManifestState,
    ) -> Self {
        Self {
            shared: Arc::new(ManifestShared {
                archive_dir,
                options,
                version,
                state: RwLock::new(state),
                locks: EntryLockTable::new(),
            }),
        }
    }

    pub fn archive_dir(&self) -> &Path {
        &self.shared.archive_dir
    }

    /// Path of the manifest file.
    pub fn path(&self) -> PathBuf {
        self.shared
            .archive_dir
            .join(&self.shared.options.manifest_file_name)
    }

    pub fn options(&self) -> &ManifestOptions {
        &self.shared.options
    }

    /// Record-layout version read from the header.
    pub fn version(&self) -> u8 {
        self.shared.version
    }

    /// Snapshot of every entry in record order.
    pub fn entries(&self) -> Vec<Entry> {
        self.shared.state.read().slots.iter().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.state.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the in-memory state differs from the last flushed or loaded file.
    pub fn is_dirty(&self) -> bool {
        self.shared.state.read().dirty
    }

    /// Next inode number not used by any entry.
    pub fn next_inode(&self) -> u64 {
        self.shared.state.read().next_inode
    }

    /// Reserve an inode number for a new entry.
    pub fn allocate_inode(&self) -> u64 {
        let mut state = self.shared.state.write();
        let inode = state.next_inode;
        state.next_inode += 1;
        inode
    }

    /// Look up an entry. Absence is a normal outcome, not an error.
    pub fn entry_with_key(&self, key: &EntryKey) -> Option<Entry> {
        self.shared.state.read().lookup(key).cloned()
    }

    pub fn entry_id(&self, key: &EntryKey) -> Option<EntryId> {
        self.shared.state.read().index.get(key).copied()
    }

    pub fn entry_by_id(&self, id: EntryId) -> Option<Entry> {
        self.shared.state.read().get(id).cloned()
    }

    pub fn handle(&self, key: &EntryKey) -> Option<EntryHandle> {
        self.entry_id(key).map(|id| EntryHandle::new(self.clone(), id))
    }

    /// Whether `key` names an entry or an implicit directory.
    pub fn node_exists(&self, key: &EntryKey) -> bool {
        key.is_root() || self.shared.state.read().tree.contains(key)
    }

    pub fn has_children(&self, key: &EntryKey) -> bool {
        self.shared.state.read().tree.has_children(key)
    }

    /// Entries directly below `key`.
    ///
    /// Implicit directories have no record and are not included; see
    /// [`Manifest::directory_listing`] for a view that has them.
    pub fn contents_of_directory(&self, key: &EntryKey) -> Result<Vec<Entry>, ManifestError> {
        let state = self.shared.state.read();
        state.ensure_directory(key)?;
        let children = state.tree.children(key).unwrap_or_default();
        Ok(children
            .into_iter()
            .filter_map(|c| c.entry.and_then(|id| state.get(id).cloned()))
            .collect())
    }

    /// Every child below `key`, implicit directories included.
    pub fn directory_listing(&self, key: &EntryKey) -> Result<Vec<DirectoryChild>, ManifestError> {
        let state = self.shared.state.read();
        state.ensure_directory(key)?;
        let children = state.tree.children(key).unwrap_or_default();
        children
            .into_iter()
            .map(|c| -> Result<DirectoryChild, ManifestError> {
                Ok(DirectoryChild {
                    key: key.join(&c.name)?,
                    entry: c.entry.and_then(|id| state.get(id).cloned()),
                    name: c.name,
                })
            })
            .collect()
    }

    /// Entries strictly below `key`, parents before children.
    pub fn descendants(&self, key: &EntryKey) -> Vec<Entry> {
        let state = self.shared.state.read();
        state
            .tree
            .descendants(key)
            .into_iter()
            .filter_map(|id| state.get(id).cloned())
            .collect()
    }

    /// Sorted names of the domains present in the manifest.
    pub fn available_domains(&self) -> Vec<String> {
        self.shared.state.read().tree.top_level_names()
    }

    #[instrument(level = "debug", skip(self, entry), fields(key = %entry.key()))]
    pub fn add_entry(&self, entry: Entry) -> Result<EntryId, ManifestError> {
        if entry.key().is_root() {
            return Err(KeyError::InvalidIdentity {
                domain: String::new(),
                path: String::new(),
                reason: "the archive root cannot hold an entry",
            }
            .into());
        }
        let mut state = self.shared.state.write();
        if state.index.contains_key(entry.key()) {
            return Err(ManifestError::DuplicateKey {
                key: entry.key().clone(),
            });
        }
        let id = state.insert(entry);
        state.dirty = true;
        trace!(%id, "Added entry");
        Ok(id)
    }

    /// Remove the entry for `key`. Its storage file is left in place.
    #[instrument(level = "debug", skip(self), fields(key = %key))]
    pub fn remove_entry_with_key(&self, key: &EntryKey) -> Result<Entry, ManifestError> {
        let mut state = self.shared.state.write();
        let id = state
            .index
            .remove(key)
            .ok_or_else(|| ManifestError::NotFound { key: key.clone() })?;
        state.tree.remove(key);
        let entry = state.slots[id.0].take();
        state.dirty = true;
        drop(state);
        self.shared.locks.remove(id);
        entry.ok_or_else(|| ManifestError::NotFound { key: key.clone() })
    }

    /// Re-key one entry. The storage file is not renamed: the entry's
    /// storage filename changes with its key, and moving the bytes is the
    /// caller's job.
    #[instrument(level = "debug", skip(self), fields(from = %from, to = %to))]
    pub fn move_entry(&self, from: &EntryKey, to: EntryKey) -> Result<EntryId, ManifestError> {
        if to.is_root() {
            return Err(ManifestError::DuplicateKey { key: to });
        }
        let mut state = self.shared.state.write();
        let id = *state
            .index
            .get(from)
            .ok_or_else(|| ManifestError::NotFound { key: from.clone() })?;
        if *from == to {
            return Ok(id);
        }
        if state.index.contains_key(&to) {
            return Err(ManifestError::DuplicateKey { key: to });
        }
        state.rekey(id, to);
        state.dirty = true;
        Ok(id)
    }

    /// Re-key the node at `from` and everything below it so that it sits at
    /// `to`, in one step. Returns `(id, old key, new key)` for every moved
    /// entry; as with [`Manifest::move_entry`], storage files stay put.
    ///
    /// Fails without changing anything if `from` does not exist, if `to` lies
    /// inside `from`, or if any destination key is taken.
    #[instrument(level = "debug", skip(self), fields(from = %from, to = %to))]
    pub fn move_tree(
        &self,
        from: &EntryKey,
        to: &EntryKey,
    ) -> Result<Vec<(EntryId, EntryKey, EntryKey)>, ManifestError> {
        if to.is_root() || from.is_root() || to.is_descendant_of(from) {
            return Err(ManifestError::DuplicateKey { key: to.clone() });
        }
        let mut state = self.shared.state.write();
        if !state.tree.contains(from) {
            return Err(ManifestError::NotFound { key: from.clone() });
        }
        if from == to {
            return Ok(Vec::new());
        }

        let mut ids: Vec<EntryId> = state.tree.entry_at(from).into_iter().collect();
        ids.extend(state.tree.descendants(from));

        let mut moves = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(entry) = state.get(id) else { continue };
            let old = entry.key().clone();
            let new = match old.rebase(from, to) {
                Some(result) => result?,
                None => continue,
            };
            if state.index.contains_key(&new) {
                return Err(ManifestError::DuplicateKey { key: new });
            }
            moves.push((id, old, new));
        }

        for (id, _, new) in &moves {
            state.rekey(*id, new.clone());
        }
        if !moves.is_empty() {
            state.dirty = true;
        }
        debug!(moved = moves.len(), "Moved subtree");
        Ok(moves)
    }

    /// Apply `f` to the entry for `key`.
    ///
    /// `f` may change any field except the key.
    pub fn update_entry<R>(
        &self,
        key: &EntryKey,
        f: impl FnOnce(&mut Entry) -> R,
    ) -> Result<R, ManifestError> {
        let mut state = self.shared.state.write();
        let id = *state
            .index
            .get(key)
            .ok_or_else(|| ManifestError::NotFound { key: key.clone() })?;
        let result = Self::apply(&mut state, id, f);
        result.ok_or_else(|| ManifestError::NotFound { key: key.clone() })
    }

    pub(crate) fn update_entry_by_id<R>(
        &self,
        id: EntryId,
        f: impl FnOnce(&mut Entry) -> R,
    ) -> Option<R> {
        Self::apply(&mut self.shared.state.write(), id, f)
    }

    fn apply<R>(state: &mut ManifestState, id: EntryId, f: impl FnOnce(&mut Entry) -> R) -> Option<R> {
        let entry = state.get_mut(id)?;
        let result = f(entry);
        let inode = entry.inode;
        state.next_inode = state.next_inode.max(inode.saturating_add(1));
        state.dirty = true;
        Some(result)
    }

    /// Write the current records, in slot order, over the manifest file.
    ///
    /// The file is replaced atomically through a temporary file in the
    /// archive directory. On failure the in-memory state, including the
    /// dirty flag, is unchanged.
    #[instrument(level = "debug", skip(self), fields(archive = %self.shared.archive_dir.display()))]
    pub fn flush_changes(&self) -> Result<(), ManifestError> {
        let mut state = self.shared.state.write();
        let bytes = self
            .shared
            .options
            .format
            .encode(state.slots.iter().flatten())?;

        let path = self.path();
        let write_failed = |source: io::Error| ManifestError::WriteFailed {
            source,
            context: ManifestContext::new()
                .with_path(&path)
                .with_operation("flush"),
        };

        let mut temp = tempfile::Builder::new()
            .prefix(".manifest-")
            .suffix(".tmp")
            .tempfile_in(&self.shared.archive_dir)
            .map_err(write_failed)?;
        temp.write_all(&bytes).map_err(write_failed)?;
        temp.as_file().sync_all().map_err(write_failed)?;
        temp.persist(&path).map_err(|e| write_failed(e.error))?;

        state.dirty = false;
        debug!(bytes = bytes.len(), entries = state.index.len(), "Flushed manifest");
        Ok(())
    }

    /// Flush only when there are unwritten changes. Returns whether it wrote.
    pub fn flush_if_dirty(&self) -> Result<bool, ManifestError> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.flush_changes()?;
        Ok(true)
    }

    pub(crate) fn locks(&self) -> &EntryLockTable {
        &self.shared.locks
    }

    /// Absolute path of the storage file for `key`.
    pub fn storage_path(&self, key: &EntryKey) -> PathBuf {
        self.shared.archive_dir.join(key.storage_filename())
    }
}
