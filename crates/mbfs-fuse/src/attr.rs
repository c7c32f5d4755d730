//! Conversion of bridge attributes to FUSE attributes.

use fuser::{FileAttr, FileType};
use mbfs_core::{NodeKind, mount::NodeAttributes};

/// Block size reported in attributes and filesystem statistics.
pub const BLOCK_SIZE: u32 = 4096;

pub fn file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Directory => FileType::Directory,
        NodeKind::Symlink => FileType::Symlink,
        NodeKind::File | NodeKind::Other => FileType::RegularFile,
    }
}

/// FUSE attributes for `attrs`, reported under inode `ino`.
///
/// Nodes without a record of their own are reported as owned by `owner`.
pub fn to_file_attr(ino: u64, attrs: &NodeAttributes, owner: (u32, u32)) -> FileAttr {
    let (uid, gid) = if attrs.implicit {
        owner
    } else {
        (attrs.user_id, attrs.group_id)
    };
    FileAttr {
        ino,
        size: attrs.size,
        blocks: attrs.size.div_ceil(512),
        atime: attrs.accessed,
        mtime: attrs.modified,
        ctime: attrs.modified,
        crtime: attrs.created,
        kind: file_type(attrs.kind),
        perm: attrs.permissions,
        nlink: attrs.nlink,
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbfs_core::EntryKey;
    use std::time::{Duration, UNIX_EPOCH};

    fn attrs(kind: NodeKind, size: u64, implicit: bool) -> NodeAttributes {
        let t = UNIX_EPOCH + Duration::from_secs(1_300_000_000);
        NodeAttributes {
            key: EntryKey::new("HomeDomain", "a").unwrap(),
            kind,
            size,
            permissions: 0o640,
            user_id: 501,
            group_id: 20,
            inode: 77,
            accessed: t,
            modified: t,
            created: t,
            nlink: 1,
            implicit,
        }
    }

    #[test]
    fn test_file_attr() {
        let attr = to_file_attr(5, &attrs(NodeKind::File, 1000, false), (0, 0));
        assert_eq!(attr.ino, 5);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, 1000);
        assert_eq!(attr.blocks, 2);
        assert_eq!(attr.perm, 0o640);
        assert_eq!((attr.uid, attr.gid), (501, 20));
        assert_eq!(attr.blksize, BLOCK_SIZE);
    }

    #[test]
    fn test_implicit_nodes_use_mount_owner() {
        let attr = to_file_attr(9, &attrs(NodeKind::Directory, 0, true), (1000, 1000));
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!((attr.uid, attr.gid), (1000, 1000));
    }

    #[test]
    fn test_other_kinds_appear_as_files() {
        assert_eq!(file_type(NodeKind::Other), FileType::RegularFile);
        assert_eq!(file_type(NodeKind::Symlink), FileType::Symlink);
    }
}
