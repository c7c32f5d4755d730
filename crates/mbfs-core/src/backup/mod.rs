//! The manifest engine: entry identities, entry records, the binary manifest
//! codec, and the in-memory index and directory tree built from it.

pub mod config;
pub mod entry;
pub mod format;
pub mod handle;
pub mod key;
pub mod locks;
pub mod manifest;
mod tree;

pub use config::{MANIFEST_FILE_NAME, ManifestOptions};
pub use entry::{Entry, NodeKind, Properties, PropertyValue};
pub use format::{DecodedManifest, ManifestFormat, PropertyEncoding};
pub use handle::EntryHandle;
pub use key::{EntryKey, KeyError};
pub use locks::EntryLockTable;
pub use manifest::{
    DirectoryChild, EntryId, Manifest, ManifestContext, ManifestError,
};
