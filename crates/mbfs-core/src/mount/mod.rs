//! Filesystem bridge between a manifest and an external mount mechanism.

pub mod backend;
pub mod bridge;
pub mod handles;
pub mod path;

pub use backend::{MountBackend, MountError, MountSession};
pub use bridge::{BackupFilesystem, BridgeError, DirEntryInfo, NodeAttributes};
pub use handles::HandleTable;
pub use path::{key_for_path, path_for_key};
