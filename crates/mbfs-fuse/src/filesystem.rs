//! FUSE filesystem implementation over a [`BackupFilesystem`].
//!
//! Every callback resolves the kernel's inode numbers to entry keys through
//! the [`InodeTable`], calls the bridge, and replies with the bridge's result
//! or its errno. The bridge does its own locking, so callbacks never hold a
//! table reference across a bridge call.

use crate::attr::{BLOCK_SIZE, file_type, to_file_attr};
use crate::config::MountConfig;
use crate::error::{FuseError, FuseResult, ToErrno};
use crate::inode::{InodeTable, ROOT_INODE};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use libc::c_int;
use mbfs_core::mount::{NodeAttributes, path_for_key};
use mbfs_core::{BackupFilesystem, EntryKey, NodeKind, OpenMode};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, trace, warn};

/// `renameat2` flag: fail if the destination exists.
const RENAME_NOREPLACE: u32 = 1;

/// Permission bits accepted from the kernel.
const PERMISSION_MASK: u32 = 0o7777;

/// A mounted archive as seen by the kernel.
pub struct BackupFuse {
    bridge: Arc<BackupFilesystem>,
    inodes: InodeTable,
    config: MountConfig,
}

impl BackupFuse {
    /// Wraps a bridge. The bridge must be mounted before the first callback.
    pub fn new(bridge: Arc<BackupFilesystem>, config: MountConfig) -> Self {
        Self {
            bridge,
            inodes: InodeTable::new(),
            config,
        }
    }

    pub fn bridge(&self) -> &Arc<BackupFilesystem> {
        &self.bridge
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    fn key(&self, ino: u64) -> FuseResult<EntryKey> {
        self.inodes.key(ino).ok_or(FuseError::InvalidInode(ino))
    }

    fn name(name: &OsStr) -> FuseResult<&str> {
        name.to_str()
            .ok_or_else(|| FuseError::InvalidName(name.to_string_lossy().into_owned()))
    }

    fn offset(offset: i64) -> FuseResult<u64> {
        u64::try_from(offset).map_err(|_| FuseError::InvalidArgument("negative offset"))
    }

    fn permissions(mode: u32, umask: u32) -> u16 {
        (mode & !umask & PERMISSION_MASK) as u16
    }

    /// Attributes for `attrs`, allocating an inode and counting a lookup.
    fn entry_attr(&self, attrs: &NodeAttributes) -> FileAttr {
        let ino = self.inodes.get_or_insert(&attrs.key);
        to_file_attr(ino, attrs, self.bridge.owner_ids())
    }

    fn attr(&self, ino: u64, attrs: &NodeAttributes) -> FileAttr {
        to_file_attr(ino, attrs, self.bridge.owner_ids())
    }

    fn do_lookup(&self, parent: u64, name: &OsStr) -> FuseResult<FileAttr> {
        let parent = self.key(parent)?;
        let attrs = self.bridge.lookup(&parent, Self::name(name)?)?;
        Ok(self.entry_attr(&attrs))
    }

    fn do_getattr(&self, ino: u64) -> FuseResult<FileAttr> {
        let key = self.key(ino)?;
        let attrs = self.bridge.getattr(&key)?;
        Ok(self.attr(ino, &attrs))
    }

    #[allow(clippy::too_many_arguments)]
    fn do_setattr(
        &self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> FuseResult<FileAttr> {
        let key = self.key(ino)?;
        let mut attrs = None;
        if let Some(size) = size {
            attrs = Some(self.bridge.truncate(&key, size, fh)?);
        }
        if let Some(mode) = mode {
            attrs = Some(self.bridge.set_mode(&key, (mode & PERMISSION_MASK) as u16)?);
        }
        if uid.is_some() || gid.is_some() {
            attrs = Some(self.bridge.set_owner(&key, uid, gid)?);
        }
        if atime.is_some() || mtime.is_some() {
            let resolve = |t: TimeOrNow| match t {
                TimeOrNow::SpecificTime(t) => t,
                TimeOrNow::Now => SystemTime::now(),
            };
            attrs = Some(
                self.bridge
                    .set_times(&key, atime.map(resolve), mtime.map(resolve))?,
            );
        }
        let attrs = match attrs {
            Some(attrs) => attrs,
            None => self.bridge.getattr(&key)?,
        };
        Ok(self.attr(ino, &attrs))
    }

    fn do_readlink(&self, ino: u64) -> FuseResult<String> {
        let key = self.key(ino)?;
        Ok(self.bridge.read_link(&key)?)
    }

    fn do_mkdir(&self, parent: u64, name: &OsStr, mode: u32, umask: u32) -> FuseResult<FileAttr> {
        let parent = self.key(parent)?;
        let attrs = self.bridge.make_directory(
            &parent,
            Self::name(name)?,
            Self::permissions(mode, umask),
        )?;
        Ok(self.entry_attr(&attrs))
    }

    fn do_symlink(&self, parent: u64, name: &OsStr, target: &Path) -> FuseResult<FileAttr> {
        let parent = self.key(parent)?;
        let target = target
            .to_str()
            .ok_or_else(|| FuseError::InvalidName(target.to_string_lossy().into_owned()))?;
        let attrs = self
            .bridge
            .make_symlink(&parent, Self::name(name)?, target)?;
        Ok(self.entry_attr(&attrs))
    }

    fn do_remove(&self, parent: u64, name: &OsStr, directory: bool) -> FuseResult<()> {
        let parent = self.key(parent)?;
        let name = Self::name(name)?;
        if directory {
            self.bridge.remove_directory(&parent, name)?;
        } else {
            self.bridge.remove_file(&parent, name)?;
        }
        if let Ok(key) = parent.join(name) {
            debug!(path = %path_for_key(&key), directory, "Removed");
            self.inodes.invalidate_key(&key);
        }
        Ok(())
    }

    fn do_rename(
        &self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
        flags: u32,
    ) -> FuseResult<()> {
        if flags & !RENAME_NOREPLACE != 0 {
            return Err(FuseError::InvalidArgument("unsupported rename flags"));
        }
        let parent = self.key(parent)?;
        let new_parent = self.key(new_parent)?;
        let name = Self::name(name)?;
        let new_name = Self::name(new_name)?;

        if flags & RENAME_NOREPLACE != 0 && self.bridge.lookup(&new_parent, new_name).is_ok() {
            return Err(FuseError::Exists);
        }
        self.bridge.rename(&parent, name, &new_parent, new_name)?;

        if let (Ok(from), Ok(to)) = (parent.join(name), new_parent.join(new_name)) {
            debug!(from = %path_for_key(&from), to = %path_for_key(&to), "Renamed");
            self.inodes.rename_subtree(&from, &to);
        }
        Ok(())
    }

    fn do_open(&self, ino: u64, flags: i32) -> FuseResult<u64> {
        let key = self.key(ino)?;
        Ok(self.bridge.open(&key, OpenMode::from_flags(flags))?)
    }

    fn do_create(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> FuseResult<(FileAttr, u64)> {
        let parent = self.key(parent)?;
        let (attrs, fh) = self.bridge.create(
            &parent,
            Self::name(name)?,
            Self::permissions(mode, umask),
            OpenMode::from_flags(flags),
        )?;
        Ok((self.entry_attr(&attrs), fh))
    }

    fn do_opendir(&self, ino: u64) -> FuseResult<()> {
        let key = self.key(ino)?;
        let attrs = self.bridge.getattr(&key)?;
        if attrs.kind != NodeKind::Directory {
            return Err(mbfs_core::BridgeError::NotADirectory { key }.into());
        }
        Ok(())
    }

    /// `.`, `..` and the children of `ino`, in listing order.
    fn directory_entries(&self, ino: u64) -> FuseResult<Vec<(u64, FileType, String)>> {
        let key = self.key(ino)?;
        let children = self.bridge.list_directory(&key)?;

        let parent_ino = key
            .parent()
            .and_then(|p| self.inodes.get_inode(&p))
            .unwrap_or(ROOT_INODE);
        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push((ino, FileType::Directory, ".".to_string()));
        entries.push((parent_ino, FileType::Directory, "..".to_string()));
        for child in children {
            let child_ino = self.inodes.get_or_insert_no_lookup_inc(&child.key);
            entries.push((child_ino, file_type(child.kind), child.name));
        }
        Ok(entries)
    }

    #[allow(clippy::useless_conversion)]
    fn reply_statfs(&self, reply: ReplyStatfs) {
        match nix::sys::statvfs::statvfs(self.bridge.archive_dir()) {
            Ok(stat) => {
                reply.statfs(
                    u64::from(stat.blocks()),
                    u64::from(stat.blocks_free()),
                    u64::from(stat.blocks_available()),
                    u64::from(stat.files()),
                    u64::from(stat.files_free()),
                    stat.fragment_size() as u32,
                    stat.name_max() as u32,
                    stat.fragment_size() as u32,
                );
            }
            Err(e) => {
                debug!(error = %e, "Failed to get statfs, using defaults");
                reply.statfs(0, 0, 0, 0, 0, BLOCK_SIZE, 255, BLOCK_SIZE);
            }
        }
    }
}

fn log_error(op: &'static str, e: &FuseError) -> c_int {
    let errno = e.to_errno();
    if errno == libc::ENOENT {
        trace!(op, error = %e, "not found");
    } else {
        debug!(op, errno, error = %e, "operation failed");
    }
    errno
}

impl Filesystem for BackupFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        if !self.bridge.is_mounted() {
            warn!("Bridge not mounted at init");
            return Err(libc::EIO);
        }
        info!(archive = %self.bridge.archive_dir().display(), "FUSE filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        if !self.bridge.is_mounted() {
            return;
        }
        match self.bridge.unmount() {
            Ok(flushed) => info!(flushed, "FUSE filesystem destroyed"),
            Err(e) => warn!(error = %e, "Failed to unmount archive"),
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!(parent, ?name, "lookup");
        match self.do_lookup(parent, name) {
            Ok(attr) => reply.entry(&self.config.attr_ttl, &attr, 0),
            Err(e) => reply.error(log_error("lookup", &e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(inode = ino, nlookup, "forget");
        self.inodes.forget(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        trace!(count = nodes.len(), "batch_forget");
        for node in nodes {
            self.inodes.forget(node.nodeid, node.nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!(inode = ino, "getattr");
        match self.do_getattr(ino) {
            Ok(attr) => reply.attr(&self.config.attr_ttl, &attr),
            Err(e) => reply.error(log_error("getattr", &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!(inode = ino, ?mode, ?uid, ?gid, ?size, "setattr");
        match self.do_setattr(ino, mode, uid, gid, size, atime, mtime, fh) {
            Ok(attr) => reply.attr(&self.config.attr_ttl, &attr),
            Err(e) => reply.error(log_error("setattr", &e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        trace!(inode = ino, "readlink");
        match self.do_readlink(ino) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(log_error("readlink", &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent, ?name, mode, "mkdir");
        match self.do_mkdir(parent, name, mode, umask) {
            Ok(attr) => reply.entry(&self.config.attr_ttl, &attr, 0),
            Err(e) => reply.error(log_error("mkdir", &e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, ?name, "unlink");
        match self.do_remove(parent, name, false) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(log_error("unlink", &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, ?name, "rmdir");
        match self.do_remove(parent, name, true) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(log_error("rmdir", &e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        trace!(parent, ?link_name, ?target, "symlink");
        match self.do_symlink(parent, link_name, target) {
            Ok(attr) => reply.entry(&self.config.attr_ttl, &attr, 0),
            Err(e) => reply.error(log_error("symlink", &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        trace!(parent, ?name, newparent, ?newname, flags, "rename");
        match self.do_rename(parent, name, newparent, newname, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(log_error("rename", &e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, flags, "open");
        match self.do_open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(log_error("open", &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(inode = ino, fh, offset, size, "read");
        let result = Self::offset(offset)
            .and_then(|offset| Ok(self.bridge.read(fh, offset, size as usize)?));
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(log_error("read", &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(inode = ino, fh, offset, size = data.len(), "write");
        let result =
            Self::offset(offset).and_then(|offset| Ok(self.bridge.write(fh, offset, data)?));
        match result {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(log_error("write", &e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!(inode = ino, fh, "flush");
        match self.bridge.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(log_error("flush", &e.into())),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        trace!(inode = ino, fh, datasync, "fsync");
        let result = self
            .bridge
            .flush(fh)
            .and_then(|()| self.bridge.sync_manifest().map(|_| ()));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(log_error("fsync", &e.into())),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(fh, "release");
        match self.bridge.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(log_error("release", &e.into())),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, "opendir");
        match self.do_opendir(ino) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(log_error("opendir", &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(inode = ino, offset, "readdir");
        let entries = match Self::offset(offset).and_then(|_| self.directory_entries(ino)) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(log_error("readdir", &e));
                return;
            }
        };
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(skip) {
            // The offset handed back is where the next call resumes.
            if reply.add(*child_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        self.reply_statfs(reply);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        trace!(parent, ?name, mode, flags, "create");
        match self.do_create(parent, name, mode, umask, flags) {
            Ok((attr, fh)) => reply.created(&self.config.attr_ttl, &attr, 0, fh, 0),
            Err(e) => reply.error(log_error("create", &e)),
        }
    }
}
