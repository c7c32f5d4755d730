//! Manifest records.
//!
//! An [`Entry`] describes one backed-up node. It names the storage file that
//! holds the node's bytes but never holds those bytes itself.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::key::EntryKey;

/// File-type mask of a POSIX mode.
pub const S_IFMT: u16 = 0o170_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFLNK: u16 = 0o120_000;
pub const S_IFREG: u16 = 0o100_000;

/// Permission bits of a POSIX mode.
pub const PERMISSION_MASK: u16 = 0o7777;

/// Kind of node an entry describes, taken from the file-type bits of its mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
    /// Device nodes, sockets and anything else the archive may record.
    Other,
}

impl NodeKind {
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFDIR => NodeKind::Directory,
            S_IFLNK => NodeKind::Symlink,
            S_IFREG => NodeKind::File,
            _ => NodeKind::Other,
        }
    }

    /// File-type bits to combine with permission bits in a mode.
    pub fn type_bits(self) -> u16 {
        match self {
            NodeKind::File | NodeKind::Other => S_IFREG,
            NodeKind::Directory => S_IFDIR,
            NodeKind::Symlink => S_IFLNK,
        }
    }
}

/// Value of an extended property.
///
/// How a value is laid out on disk is decided by the manifest's
/// [`PropertyEncoding`](super::format::PropertyEncoding). The tagged encoding
/// keeps the variant; the raw encoding stores the bare bytes and reads them
/// back as [`PropertyValue::String`] or [`PropertyValue::Bytes`], which is why
/// [`PropertyValue::as_integer`] and [`PropertyValue::as_bool`] also accept the
/// text forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Bytes(Vec<u8>),
}

impl PropertyValue {
    /// Interpret untagged bytes: UTF-8 becomes a string, anything else stays bytes.
    pub fn from_raw(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(s) => PropertyValue::String(s.to_string()),
            Err(_) => PropertyValue::Bytes(bytes.to_vec()),
        }
    }

    /// Untagged form: integers in decimal, booleans as `"1"`/`"0"`.
    pub fn to_raw(&self) -> Vec<u8> {
        match self {
            PropertyValue::String(s) => s.as_bytes().to_vec(),
            PropertyValue::Integer(i) => i.to_string().into_bytes(),
            PropertyValue::Boolean(b) => if *b { b"1".to_vec() } else { b"0".to_vec() },
            PropertyValue::Bytes(b) => b.clone(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            PropertyValue::Integer(i) => Some(*i),
            PropertyValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Boolean(b) => Some(*b),
            PropertyValue::String(s) if s == "1" => Some(true),
            PropertyValue::String(s) if s == "0" => Some(false),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Boolean(value)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(value: Vec<u8>) -> Self {
        PropertyValue::Bytes(value)
    }
}

/// Extended properties of an entry, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pairs: Vec<(String, PropertyValue)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.pairs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Set `name` to `value`. An existing property keeps its position; a new one
    /// is appended. Returns the previous value.
    pub fn set(&mut self, name: impl Into<String>, value: PropertyValue) -> Option<PropertyValue> {
        let name = name.into();
        if let Some((_, slot)) = self.pairs.iter_mut().find(|(n, _)| *n == name) {
            return Some(std::mem::replace(slot, value));
        }
        self.pairs.push((name, value));
        None
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        let idx = self.pairs.iter().position(|(n, _)| n == name)?;
        Some(self.pairs.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v))
    }
}

impl FromIterator<(String, PropertyValue)> for Properties {
    fn from_iter<T: IntoIterator<Item = (String, PropertyValue)>>(iter: T) -> Self {
        let mut props = Properties::new();
        for (name, value) in iter {
            props.set(name, value);
        }
        props
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

fn to_system_time(secs: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::from(secs))
}

/// One manifest record.
///
/// `file_length` is always the plaintext length, whatever padding the storage
/// file carries. The key can only be changed by the manifest, which keeps its
/// index and tree in step.
#[derive(Clone, PartialEq, Eq)]
pub struct Entry {
    key: EntryKey,
    /// Target of a symbolic link; `None` when the record has no target.
    pub link_target: Option<String>,
    /// SHA-1 of the plaintext contents, when recorded.
    pub digest: Option<Vec<u8>>,
    /// Stored key material; `None` means the contents are not encrypted.
    pub encryption_key: Option<Vec<u8>>,
    pub mode: u16,
    pub inode: u64,
    pub user_id: u32,
    pub group_id: u32,
    pub modified_time: u32,
    pub accessed_time: u32,
    pub created_time: u32,
    pub file_length: u64,
    pub flag: u8,
    pub properties: Properties,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("kind", &self.kind())
            .field("link_target", &self.link_target)
            .field("digest", &self.digest.as_ref().map(hex::encode))
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("mode", &format_args!("{:o}", self.mode))
            .field("inode", &self.inode)
            .field("file_length", &self.file_length)
            .field("flag", &self.flag)
            .field("properties", &self.properties.len())
            .finish_non_exhaustive()
    }
}

impl Entry {
    /// A record with the given identity and mode and every other field zeroed.
    pub fn new(key: EntryKey, mode: u16) -> Self {
        Self {
            key,
            link_target: None,
            digest: None,
            encryption_key: None,
            mode,
            inode: 0,
            user_id: 0,
            group_id: 0,
            modified_time: 0,
            accessed_time: 0,
            created_time: 0,
            file_length: 0,
            flag: 0,
            properties: Properties::new(),
        }
    }

    /// A new empty regular file stamped with the current time.
    pub fn file(key: EntryKey, permissions: u16) -> Self {
        Self::new(key, S_IFREG | (permissions & PERMISSION_MASK)).stamped_now()
    }

    pub fn directory(key: EntryKey, permissions: u16) -> Self {
        Self::new(key, S_IFDIR | (permissions & PERMISSION_MASK)).stamped_now()
    }

    pub fn symlink(key: EntryKey, target: impl Into<String>) -> Self {
        let mut entry = Self::new(key, S_IFLNK | 0o755).stamped_now();
        entry.link_target = Some(target.into());
        entry
    }

    fn stamped_now(mut self) -> Self {
        let now = unix_now();
        self.modified_time = now;
        self.accessed_time = now;
        self.created_time = now;
        self
    }

    #[must_use]
    pub fn with_owner(mut self, user_id: u32, group_id: u32) -> Self {
        self.user_id = user_id;
        self.group_id = group_id;
        self
    }

    #[must_use]
    pub fn with_inode(mut self, inode: u64) -> Self {
        self.inode = inode;
        self
    }

    #[must_use]
    pub fn with_encryption_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    pub fn key(&self) -> &EntryKey {
        &self.key
    }

    pub(crate) fn set_key(&mut self, key: EntryKey) {
        self.key = key;
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::from_mode(self.mode)
    }

    pub fn is_directory(&self) -> bool {
        self.kind() == NodeKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind() == NodeKind::Symlink
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption_key.is_some()
    }

    pub fn permissions(&self) -> u16 {
        self.mode & PERMISSION_MASK
    }

    /// Replace the permission bits, keeping the file type.
    pub fn set_permissions(&mut self, permissions: u16) {
        self.mode = (self.mode & S_IFMT) | (permissions & PERMISSION_MASK);
    }

    /// Storage filename of this entry inside the archive directory.
    pub fn local_path_in_backup(&self) -> String {
        self.key.storage_filename()
    }

    pub fn property_value(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn set_property_value(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.set(name, value.into());
    }

    pub fn modified_at(&self) -> SystemTime {
        to_system_time(self.modified_time)
    }

    pub fn accessed_at(&self) -> SystemTime {
        to_system_time(self.accessed_time)
    }

    pub fn created_at(&self) -> SystemTime {
        to_system_time(self.created_time)
    }

    /// Stamp the modification time with the current time.
    pub fn touch_modified(&mut self) {
        self.modified_time = unix_now();
    }
}
