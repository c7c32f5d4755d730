//! Manifest engine and encrypted random-access file layer for mobile device
//! backup archives.
//!
//! An archive is a flat directory of content files named by the SHA-1 of their
//! `(domain, path)` identity, plus a binary `Manifest.mbdb` describing every
//! backed-up node. This crate parses and rewrites that manifest, keeps an
//! in-memory index and directory tree of its entries, and gives offset-based
//! read/write access to entry contents, decrypting AES-256-CBC protected
//! entries on the fly.
//!
//! # Usage
//!
//! ```ignore
//! use mbfs_core::{EntryKey, Manifest, OpenMode};
//!
//! let manifest = Manifest::load(archive_dir)?;
//! let key = EntryKey::new("HomeDomain", "Library/Preferences/com.apple.foo.plist")?;
//! let handle = manifest.handle(&key).expect("entry exists");
//! let mut file = handle.open_with_mode(OpenMode::READ_ONLY)?;
//! let bytes = file.read_range(0, 4096)?;
//! file.close()?;
//! ```

pub mod backup;
pub mod crypto;
pub mod cursor;
pub mod error;
pub mod fs;
pub mod mount;

pub use backup::{
    Entry, EntryHandle, EntryId, EntryKey, Manifest, ManifestFormat, ManifestOptions, NodeKind,
    PropertyValue,
};
pub use error::{ErrorCategory, FileError, KeyError, ManifestError};
pub use fs::{OpenMode, OpenedFile};
pub use mount::{BackupFilesystem, BridgeError, MountBackend, MountSession};
