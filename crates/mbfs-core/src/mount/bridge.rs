//! Filesystem operations over a manifest.
//!
//! [`BackupFilesystem`] answers the requests a mount collaborator forwards:
//! attribute and directory queries go to the manifest tree, file I/O goes
//! through [`OpenedFile`] handles kept in a [`HandleTable`].
//!
//! The namespace has the archive root at the top, one directory per domain
//! below it, and each domain's entries at their relative paths. Directories
//! that have children but no record of their own appear as implicit
//! directories.
//!
//! # Lifecycle
//!
//! [`BackupFilesystem::mount`] loads the manifest. Every operation holds a
//! shared gate for its duration; [`BackupFilesystem::unmount`] takes the gate
//! exclusively, so it waits for in-flight calls, closes all open handles and
//! flushes the manifest if it changed.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use super::handles::HandleTable;
use crate::backup::{
    Entry, EntryKey, KeyError, Manifest, ManifestError, ManifestOptions, NodeKind,
};
use crate::error::ErrorCategory;
use crate::fs::{FileError, OpenMode, OpenedFile};

/// Permission bits reported for the root and implicit directories.
pub const IMPLICIT_DIR_PERMISSIONS: u16 = 0o755;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Archive is not mounted")]
    NotMounted,

    #[error("Archive is already mounted")]
    AlreadyMounted,

    #[error("Archive is mounted read-only: cannot {operation}")]
    ReadOnly { operation: &'static str },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("No such node: {key}")]
    NotFound { key: EntryKey },

    #[error("Directory not empty: {key}")]
    NotEmpty { key: EntryKey },

    #[error("Is a directory: {key}")]
    IsDirectory { key: EntryKey },

    #[error("Not a directory: {key}")]
    NotADirectory { key: EntryKey },

    #[error("Not a symbolic link: {key}")]
    NotASymlink { key: EntryKey },

    #[error("Invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Unknown file handle {0}")]
    InvalidHandle(u64),

    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("IO error on {path:?}: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

impl BridgeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotMounted | Self::Io { .. } => ErrorCategory::IoError,
            Self::AlreadyMounted => ErrorCategory::AlreadyExists,
            Self::ReadOnly { .. } => ErrorCategory::ReadOnlyFilesystem,
            Self::Manifest(e) => ErrorCategory::from(e),
            Self::File(e) => ErrorCategory::from(e),
            Self::Key(e) => ErrorCategory::from(e),
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::NotEmpty { .. } => ErrorCategory::NotEmpty,
            Self::IsDirectory { .. } => ErrorCategory::IsDirectory,
            Self::NotADirectory { .. } => ErrorCategory::NotDirectory,
            Self::NotASymlink { .. } | Self::InvalidName { .. } => ErrorCategory::InvalidArgument,
            Self::InvalidHandle(_) => ErrorCategory::BadHandle,
            Self::NotSupported(_) => ErrorCategory::NotSupported,
        }
    }

    pub fn to_errno(&self) -> i32 {
        self.category().to_errno()
    }
}

/// Attributes of one node in the mounted namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttributes {
    pub key: EntryKey,
    pub kind: NodeKind,
    /// Plaintext length for files, target length for symlinks.
    pub size: u64,
    pub permissions: u16,
    pub user_id: u32,
    pub group_id: u32,
    /// Inode number recorded in the manifest; 0 for nodes without a record.
    pub inode: u64,
    pub accessed: SystemTime,
    pub modified: SystemTime,
    pub created: SystemTime,
    pub nlink: u32,
    /// The node has no record of its own.
    pub implicit: bool,
}

/// One child in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub key: EntryKey,
    pub kind: NodeKind,
}

fn listed_kind(kind: NodeKind) -> NodeKind {
    match kind {
        NodeKind::Other => NodeKind::File,
        other => other,
    }
}

#[derive(Debug)]
struct Mounted {
    manifest: Manifest,
    mounted_at: SystemTime,
}

/// Bridge between a mount collaborator and one archive.
#[derive(Debug)]
pub struct BackupFilesystem {
    archive_dir: PathBuf,
    options: ManifestOptions,
    read_only: bool,
    owner: (u32, u32),
    gate: RwLock<Option<Mounted>>,
    handles: HandleTable<OpenedFile>,
}

impl BackupFilesystem {
    /// A bridge for the archive at `archive_dir`. Nothing is read until
    /// [`BackupFilesystem::mount`].
    pub fn new(archive_dir: impl Into<PathBuf>, options: ManifestOptions) -> Self {
        // SAFETY: getuid and getgid cannot fail and touch no memory.
        let owner = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            archive_dir: archive_dir.into(),
            options,
            read_only: false,
            owner,
            gate: RwLock::new(None),
            handles: HandleTable::new(),
        }
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Owner recorded on nodes created through the bridge.
    #[must_use]
    pub fn owner(mut self, user_id: u32, group_id: u32) -> Self {
        self.owner = (user_id, group_id);
        self
    }

    /// `(user_id, group_id)` given to created nodes.
    pub fn owner_ids(&self) -> (u32, u32) {
        self.owner
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_mounted(&self) -> bool {
        self.gate.read().is_some()
    }

    pub fn open_handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Load the manifest and start serving.
    #[instrument(level = "info", skip(self), fields(archive = %self.archive_dir.display()))]
    pub fn mount(&self) -> Result<(), BridgeError> {
        let mut gate = self.gate.write();
        if gate.is_some() {
            return Err(BridgeError::AlreadyMounted);
        }
        let manifest = Manifest::load_with_options(&self.archive_dir, self.options.clone())?;
        info!(
            entries = manifest.len(),
            domains = manifest.available_domains().len(),
            read_only = self.read_only,
            "Archive mounted"
        );
        *gate = Some(Mounted {
            manifest,
            mounted_at: SystemTime::now(),
        });
        Ok(())
    }

    /// Stop serving: close every open handle and flush the manifest if it
    /// changed. Returns whether the manifest was written.
    ///
    /// If the flush fails the bridge stays mounted with its state intact, so
    /// the call can be retried.
    #[instrument(level = "info", skip(self), fields(archive = %self.archive_dir.display()))]
    pub fn unmount(&self) -> Result<bool, BridgeError> {
        let mut gate = self.gate.write();
        let Some(mounted) = gate.as_ref() else {
            return Err(BridgeError::NotMounted);
        };

        for (fh, mut file) in self.handles.drain() {
            if let Err(e) = file.close() {
                warn!(fh, key = %file.key(), error = %e, "Failed to close handle during unmount");
            }
        }

        let flushed = mounted.manifest.flush_if_dirty()?;
        *gate = None;
        info!(flushed, "Archive unmounted");
        Ok(flushed)
    }

    /// Persist pending manifest changes without unmounting.
    pub fn sync_manifest(&self) -> Result<bool, BridgeError> {
        self.with_manifest(|m| Ok(m.manifest.flush_if_dirty()?))
    }

    fn with_manifest<R>(
        &self,
        f: impl FnOnce(&Mounted) -> Result<R, BridgeError>,
    ) -> Result<R, BridgeError> {
        let gate = self.gate.read();
        let mounted = gate.as_ref().ok_or(BridgeError::NotMounted)?;
        f(mounted)
    }

    fn check_writable(&self, operation: &'static str) -> Result<(), BridgeError> {
        if self.read_only {
            return Err(BridgeError::ReadOnly { operation });
        }
        Ok(())
    }

    fn child_key(parent: &EntryKey, name: &str) -> Result<EntryKey, BridgeError> {
        parent.join(name).map_err(|_| BridgeError::InvalidName {
            name: name.to_string(),
            reason: "not a valid path component",
        })
    }

    fn attributes(mounted: &Mounted, key: &EntryKey) -> Result<NodeAttributes, BridgeError> {
        if let Some(entry) = mounted.manifest.entry_with_key(key) {
            return Ok(Self::entry_attributes(&entry));
        }
        if mounted.manifest.node_exists(key) {
            return Ok(NodeAttributes {
                key: key.clone(),
                kind: NodeKind::Directory,
                size: 0,
                permissions: IMPLICIT_DIR_PERMISSIONS,
                user_id: 0,
                group_id: 0,
                inode: 0,
                accessed: mounted.mounted_at,
                modified: mounted.mounted_at,
                created: mounted.mounted_at,
                nlink: 2,
                implicit: true,
            });
        }
        Err(BridgeError::NotFound { key: key.clone() })
    }

    fn entry_attributes(entry: &Entry) -> NodeAttributes {
        let kind = listed_kind(entry.kind());
        let size = match kind {
            NodeKind::Symlink => entry.link_target.as_ref().map_or(0, |t| t.len() as u64),
            NodeKind::Directory => 0,
            _ => entry.file_length,
        };
        NodeAttributes {
            key: entry.key().clone(),
            kind,
            size,
            permissions: entry.permissions(),
            user_id: entry.user_id,
            group_id: entry.group_id,
            inode: entry.inode,
            accessed: entry.accessed_at(),
            modified: entry.modified_at(),
            created: entry.created_at(),
            nlink: if kind == NodeKind::Directory { 2 } else { 1 },
            implicit: false,
        }
    }

    /// Fail unless `key` is a directory that exists.
    fn require_directory(mounted: &Mounted, key: &EntryKey) -> Result<(), BridgeError> {
        let attrs = Self::attributes(mounted, key)?;
        if attrs.kind != NodeKind::Directory {
            return Err(BridgeError::NotADirectory { key: key.clone() });
        }
        Ok(())
    }

    fn require_absent(mounted: &Mounted, key: &EntryKey) -> Result<(), BridgeError> {
        if mounted.manifest.node_exists(key) {
            return Err(ManifestError::DuplicateKey { key: key.clone() }.into());
        }
        Ok(())
    }

    #[instrument(level = "trace", skip(self), fields(parent = %parent))]
    pub fn lookup(&self, parent: &EntryKey, name: &str) -> Result<NodeAttributes, BridgeError> {
        let key = Self::child_key(parent, name)?;
        self.with_manifest(|m| Self::attributes(m, &key))
    }

    pub fn getattr(&self, key: &EntryKey) -> Result<NodeAttributes, BridgeError> {
        self.with_manifest(|m| Self::attributes(m, key))
    }

    /// Children of the directory at `key`. The root lists the domains.
    #[instrument(level = "trace", skip(self), fields(key = %key))]
    pub fn list_directory(&self, key: &EntryKey) -> Result<Vec<DirEntryInfo>, BridgeError> {
        self.with_manifest(|m| {
            let mut children: Vec<DirEntryInfo> = Vec::new();
            if key.is_root() {
                for domain in m.manifest.available_domains() {
                    let key = EntryKey::domain_root(domain.clone())?;
                    let kind = m
                        .manifest
                        .entry_with_key(&key)
                        .map_or(NodeKind::Directory, |e| listed_kind(e.kind()));
                    children.push(DirEntryInfo {
                        name: domain,
                        key,
                        kind,
                    });
                }
                return Ok(children);
            }
            for child in m.manifest.directory_listing(key)? {
                children.push(DirEntryInfo {
                    kind: child
                        .entry
                        .as_ref()
                        .map_or(NodeKind::Directory, |e| listed_kind(e.kind())),
                    name: child.name,
                    key: child.key,
                });
            }
            Ok(children)
        })
    }

    pub fn read_link(&self, key: &EntryKey) -> Result<String, BridgeError> {
        self.with_manifest(|m| {
            let entry = m
                .manifest
                .entry_with_key(key)
                .ok_or_else(|| BridgeError::NotFound { key: key.clone() })?;
            match (entry.kind(), entry.link_target) {
                (NodeKind::Symlink, Some(target)) => Ok(target),
                _ => Err(BridgeError::NotASymlink { key: key.clone() }),
            }
        })
    }

    /// Open the file at `key` and return a handle id.
    #[instrument(level = "debug", skip(self), fields(key = %key))]
    pub fn open(&self, key: &EntryKey, mode: OpenMode) -> Result<u64, BridgeError> {
        if mode.write || mode.truncate {
            self.check_writable("open for writing")?;
        }
        self.with_manifest(|m| {
            let attrs = Self::attributes(m, key)?;
            if attrs.kind == NodeKind::Directory {
                return Err(BridgeError::IsDirectory { key: key.clone() });
            }
            let handle = m
                .manifest
                .handle(key)
                .ok_or_else(|| BridgeError::NotFound { key: key.clone() })?;
            let file = handle.open_with_mode(mode)?;
            let fh = self.handles.insert(file);
            debug!(fh, "Opened handle");
            Ok(fh)
        })
    }

    /// Create an empty regular file and open it for writing.
    #[instrument(level = "debug", skip(self), fields(parent = %parent))]
    pub fn create(
        &self,
        parent: &EntryKey,
        name: &str,
        permissions: u16,
        mode: OpenMode,
    ) -> Result<(NodeAttributes, u64), BridgeError> {
        self.check_writable("create")?;
        let key = Self::child_key(parent, name)?;
        if parent.is_root() {
            return Err(BridgeError::InvalidName {
                name: name.to_string(),
                reason: "only directories can be created at the top level",
            });
        }
        self.with_manifest(|m| {
            Self::require_directory(m, parent)?;
            Self::require_absent(m, &key)?;

            let entry = Entry::file(key.clone(), permissions)
                .with_owner(self.owner.0, self.owner.1)
                .with_inode(m.manifest.allocate_inode());
            let attrs = Self::entry_attributes(&entry);
            m.manifest.add_entry(entry)?;

            let mode = OpenMode {
                write: true,
                truncate: true,
                ..mode
            };
            let opened = m
                .manifest
                .handle(&key)
                .ok_or_else(|| BridgeError::NotFound { key: key.clone() })
                .and_then(|h| Ok(h.creat_with_mode(mode)?));
            match opened {
                Ok(file) => {
                    let fh = self.handles.insert(file);
                    debug!(fh, "Created file");
                    Ok((attrs, fh))
                }
                Err(e) => {
                    if let Err(rollback) = m.manifest.remove_entry_with_key(&key) {
                        warn!(error = %rollback, "Failed to roll back created entry");
                    }
                    Err(e)
                }
            }
        })
    }

    pub fn read(&self, fh: u64, offset: u64, size: usize) -> Result<Vec<u8>, BridgeError> {
        self.with_manifest(|_| {
            let file = self.handles.get(fh).ok_or(BridgeError::InvalidHandle(fh))?;
            let data = file.read_range(offset, size)?;
            trace!(fh, offset, size, read = data.len(), "read");
            Ok(data)
        })
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize, BridgeError> {
        self.check_writable("write")?;
        self.with_manifest(|_| {
            let mut file = self
                .handles
                .get_mut(fh)
                .ok_or(BridgeError::InvalidHandle(fh))?;
            Ok(file.write_at(data, offset)?)
        })
    }

    /// Set the length of the file at `key`, through `fh` when the caller has
    /// one open for writing.
    #[instrument(level = "debug", skip(self), fields(key = %key))]
    pub fn truncate(
        &self,
        key: &EntryKey,
        size: u64,
        fh: Option<u64>,
    ) -> Result<NodeAttributes, BridgeError> {
        self.check_writable("truncate")?;
        self.with_manifest(|m| {
            if let Some(fh) = fh
                && let Some(mut file) = self.handles.get_mut(fh)
                && file.mode().write
            {
                file.set_len(size)?;
            } else {
                let attrs = Self::attributes(m, key)?;
                if attrs.kind == NodeKind::Directory {
                    return Err(BridgeError::IsDirectory { key: key.clone() });
                }
                let handle = m
                    .manifest
                    .handle(key)
                    .ok_or_else(|| BridgeError::NotFound { key: key.clone() })?;
                let mut file = handle.open_with_mode(OpenMode::WRITE_ONLY)?;
                file.set_len(size)?;
                file.close()?;
            }
            Self::attributes(m, key)
        })
    }

    /// Close the handle `fh`.
    pub fn release(&self, fh: u64) -> Result<(), BridgeError> {
        self.with_manifest(|_| {
            let mut file = self.handles.remove(fh).ok_or(BridgeError::InvalidHandle(fh))?;
            file.close()?;
            debug!(fh, key = %file.key(), "Released handle");
            Ok(())
        })
    }

    /// Push written bytes of `fh` to the storage device.
    pub fn flush(&self, fh: u64) -> Result<(), BridgeError> {
        self.with_manifest(|_| {
            let file = self.handles.get(fh).ok_or(BridgeError::InvalidHandle(fh))?;
            if file.mode().write {
                file.sync()?;
            }
            Ok(())
        })
    }

    #[instrument(level = "debug", skip(self), fields(parent = %parent))]
    pub fn make_directory(
        &self,
        parent: &EntryKey,
        name: &str,
        permissions: u16,
    ) -> Result<NodeAttributes, BridgeError> {
        self.check_writable("create a directory")?;
        let key = Self::child_key(parent, name)?;
        self.with_manifest(|m| {
            Self::require_directory(m, parent)?;
            Self::require_absent(m, &key)?;
            let entry = Entry::directory(key, permissions)
                .with_owner(self.owner.0, self.owner.1)
                .with_inode(m.manifest.allocate_inode());
            let attrs = Self::entry_attributes(&entry);
            m.manifest.add_entry(entry)?;
            Ok(attrs)
        })
    }

    #[instrument(level = "debug", skip(self), fields(parent = %parent))]
    pub fn make_symlink(
        &self,
        parent: &EntryKey,
        name: &str,
        target: &str,
    ) -> Result<NodeAttributes, BridgeError> {
        self.check_writable("create a symbolic link")?;
        let key = Self::child_key(parent, name)?;
        if parent.is_root() {
            return Err(BridgeError::InvalidName {
                name: name.to_string(),
                reason: "only directories can be created at the top level",
            });
        }
        self.with_manifest(|m| {
            Self::require_directory(m, parent)?;
            Self::require_absent(m, &key)?;
            let entry = Entry::symlink(key, target)
                .with_owner(self.owner.0, self.owner.1)
                .with_inode(m.manifest.allocate_inode());
            let attrs = Self::entry_attributes(&entry);
            m.manifest.add_entry(entry)?;
            Ok(attrs)
        })
    }

    /// Remove the record of a non-directory. The storage file stays.
    #[instrument(level = "debug", skip(self), fields(parent = %parent))]
    pub fn remove_file(&self, parent: &EntryKey, name: &str) -> Result<(), BridgeError> {
        self.check_writable("remove")?;
        let key = Self::child_key(parent, name)?;
        self.with_manifest(|m| {
            let attrs = Self::attributes(m, &key)?;
            if attrs.kind == NodeKind::Directory {
                return Err(BridgeError::IsDirectory { key });
            }
            m.manifest.remove_entry_with_key(&key)?;
            Ok(())
        })
    }

    /// Remove an empty directory.
    #[instrument(level = "debug", skip(self), fields(parent = %parent))]
    pub fn remove_directory(&self, parent: &EntryKey, name: &str) -> Result<(), BridgeError> {
        self.check_writable("remove a directory")?;
        let key = Self::child_key(parent, name)?;
        self.with_manifest(|m| {
            let attrs = Self::attributes(m, &key)?;
            if attrs.kind != NodeKind::Directory {
                return Err(BridgeError::NotADirectory { key });
            }
            if m.manifest.has_children(&key) {
                return Err(BridgeError::NotEmpty { key });
            }
            if !attrs.implicit {
                m.manifest.remove_entry_with_key(&key)?;
            }
            Ok(())
        })
    }

    /// Move a node, and everything below it, to a new name.
    ///
    /// Storage files move with their entries. An existing destination is
    /// replaced when it is a non-directory, or an empty directory, of the
    /// same kind as the source. On failure every change is undone.
    #[instrument(level = "debug", skip(self), fields(parent = %parent, new_parent = %new_parent))]
    pub fn rename(
        &self,
        parent: &EntryKey,
        name: &str,
        new_parent: &EntryKey,
        new_name: &str,
    ) -> Result<(), BridgeError> {
        self.check_writable("rename")?;
        let from = Self::child_key(parent, name)?;
        let to = Self::child_key(new_parent, new_name)?;
        if from == to {
            return Ok(());
        }
        if to.is_descendant_of(&from) {
            return Err(BridgeError::InvalidName {
                name: new_name.to_string(),
                reason: "cannot move a directory inside itself",
            });
        }

        self.with_manifest(|m| {
            let source = Self::attributes(m, &from)?;
            Self::require_directory(m, new_parent)?;
            let source_is_dir = source.kind == NodeKind::Directory;

            let replaced = match Self::attributes(m, &to) {
                Ok(dest) => {
                    let dest_is_dir = dest.kind == NodeKind::Directory;
                    if dest_is_dir && !source_is_dir {
                        return Err(BridgeError::IsDirectory { key: to });
                    }
                    if !dest_is_dir && source_is_dir {
                        return Err(BridgeError::NotADirectory { key: to });
                    }
                    if m.manifest.has_children(&to) {
                        return Err(BridgeError::NotEmpty { key: to });
                    }
                    if dest.implicit {
                        None
                    } else {
                        Some(m.manifest.remove_entry_with_key(&to)?)
                    }
                }
                Err(BridgeError::NotFound { .. }) => None,
                Err(e) => return Err(e),
            };

            let moves = match m.manifest.move_tree(&from, &to) {
                Ok(moves) => moves,
                Err(e) => {
                    Self::restore(m, replaced);
                    return Err(e.into());
                }
            };

            let mut storage = StorageMoves::default();
            for (_, old, new) in &moves {
                let old_path = m.manifest.storage_path(old);
                let new_path = m.manifest.storage_path(new);
                if let Err(source) = storage.move_file(&old_path, &new_path) {
                    warn!(error = %source, "Storage rename failed, rolling back");
                    storage.roll_back();
                    if let Err(e) = m.manifest.move_tree(&to, &from) {
                        warn!(error = %e, "Failed to restore moved entries");
                    }
                    Self::restore(m, replaced);
                    return Err(BridgeError::Io {
                        source,
                        path: old_path,
                    });
                }
            }
            storage.discard_parked();
            debug!(
                moved = moves.len(),
                storage_files = storage.renamed.len(),
                "Renamed"
            );
            Ok(())
        })
    }

    fn restore(mounted: &Mounted, replaced: Option<Entry>) {
        if let Some(entry) = replaced
            && let Err(e) = mounted.manifest.add_entry(entry)
        {
            warn!(error = %e, "Failed to restore replaced entry");
        }
    }

    /// Apply `f` to the record at `key`, creating a directory record first if
    /// `key` is an implicit directory.
    fn update_metadata(
        &self,
        key: &EntryKey,
        operation: &'static str,
        f: impl FnOnce(&mut Entry),
    ) -> Result<NodeAttributes, BridgeError> {
        self.check_writable(operation)?;
        self.with_manifest(|m| {
            if key.is_root() {
                return Err(BridgeError::NotSupported("changing the archive root"));
            }
            let attrs = Self::attributes(m, key)?;
            if attrs.implicit {
                let entry = Entry::directory(key.clone(), IMPLICIT_DIR_PERMISSIONS)
                    .with_owner(self.owner.0, self.owner.1)
                    .with_inode(m.manifest.allocate_inode());
                m.manifest.add_entry(entry)?;
            }
            m.manifest.update_entry(key, f)?;
            Self::attributes(m, key)
        })
    }

    pub fn set_mode(&self, key: &EntryKey, permissions: u16) -> Result<NodeAttributes, BridgeError> {
        self.update_metadata(key, "change permissions", |e| e.set_permissions(permissions))
    }

    pub fn set_owner(
        &self,
        key: &EntryKey,
        user_id: Option<u32>,
        group_id: Option<u32>,
    ) -> Result<NodeAttributes, BridgeError> {
        self.update_metadata(key, "change owner", |e| {
            if let Some(uid) = user_id {
                e.user_id = uid;
            }
            if let Some(gid) = group_id {
                e.group_id = gid;
            }
        })
    }

    pub fn set_times(
        &self,
        key: &EntryKey,
        accessed: Option<SystemTime>,
        modified: Option<SystemTime>,
    ) -> Result<NodeAttributes, BridgeError> {
        self.update_metadata(key, "change times", |e| {
            if let Some(t) = accessed {
                e.accessed_time = to_unix_seconds(t);
            }
            if let Some(t) = modified {
                e.modified_time = to_unix_seconds(t);
            }
        })
    }
}

/// Storage file moves made by one rename, kept so they can be undone.
///
/// A file already sitting at a destination storage name is parked beside it
/// first, so a moved entry never picks up bytes that belong to another one.
#[derive(Debug, Default)]
struct StorageMoves {
    renamed: Vec<(PathBuf, PathBuf)>,
    parked: Vec<(PathBuf, PathBuf)>,
}

impl StorageMoves {
    fn parked_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(".replaced");
        PathBuf::from(name)
    }

    /// Move `old` to `new`. A missing `old` still clears `new`.
    fn move_file(&mut self, old: &Path, new: &Path) -> io::Result<()> {
        match std::fs::symlink_metadata(new) {
            Ok(_) => {
                let aside = Self::parked_path(new);
                std::fs::rename(new, &aside)?;
                self.parked.push((new.to_path_buf(), aside));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        match std::fs::rename(old, new) {
            Ok(()) => {
                self.renamed.push((old.to_path_buf(), new.to_path_buf()));
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(path = %old.display(), "No storage file to move");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn roll_back(&self) {
        for (old, new) in self.renamed.iter().rev() {
            if let Err(e) = std::fs::rename(new, old) {
                warn!(error = %e, path = %new.display(), "Failed to restore storage file");
            }
        }
        for (original, aside) in self.parked.iter().rev() {
            if let Err(e) = std::fs::rename(aside, original) {
                warn!(error = %e, path = %aside.display(), "Failed to restore replaced storage file");
            }
        }
    }

    fn discard_parked(&self) {
        for (_, aside) in &self.parked {
            if let Err(e) = std::fs::remove_file(aside) {
                warn!(error = %e, path = %aside.display(), "Failed to remove replaced storage file");
            }
        }
    }
}

fn to_unix_seconds(time: SystemTime) -> u32 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_error_categories() {
        assert_eq!(BridgeError::NotMounted.category(), ErrorCategory::IoError);
        assert_eq!(
            BridgeError::InvalidHandle(3).to_errno(),
            libc::EBADF
        );
        assert_eq!(
            BridgeError::ReadOnly { operation: "write" }.to_errno(),
            libc::EROFS
        );
        let dup = BridgeError::from(ManifestError::DuplicateKey {
            key: EntryKey::root(),
        });
        assert_eq!(dup.to_errno(), libc::EEXIST);
    }

    #[test]
    fn test_unix_seconds() {
        assert_eq!(to_unix_seconds(UNIX_EPOCH), 0);
        let later = UNIX_EPOCH + std::time::Duration::from_secs(1_000);
        assert_eq!(to_unix_seconds(later), 1_000);
    }

    #[test]
    fn test_unmounted_bridge_rejects_calls() {
        let fs = BackupFilesystem::new("/nonexistent", ManifestOptions::default());
        assert!(!fs.is_mounted());
        assert!(matches!(
            fs.getattr(&EntryKey::root()),
            Err(BridgeError::NotMounted)
        ));
        assert!(matches!(fs.unmount(), Err(BridgeError::NotMounted)));
    }
}
