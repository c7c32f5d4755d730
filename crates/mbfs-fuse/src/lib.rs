//! FUSE filesystem for mobile device backup archives.
//!
//! Mounts an archive directory so its domains appear as top-level folders and
//! every manifest entry appears at its path below them. Reads and writes go
//! through [`mbfs_core`], so encrypted entries are decrypted transparently and
//! the manifest is rewritten on unmount when anything changed.
//!
//! # Example
//!
//! ```no_run
//! use mbfs_core::MountBackend;
//! use mbfs_fuse::{FuseBackend, MountConfig};
//! use std::path::Path;
//!
//! let backend = FuseBackend::new(MountConfig::default().read_only(true));
//! let session = backend.mount(Path::new("/backups/phone"), Path::new("/mnt/phone"))?;
//! // ... browse /mnt/phone ...
//! session.unmount()?;
//! # Ok::<(), mbfs_core::mount::MountError>(())
//! ```
//!
//! # Platform Support
//!
//! - **Linux**: the kernel FUSE device (`/dev/fuse`)
//! - **macOS**: macFUSE

pub mod attr;
pub mod backend;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod inode;

pub use backend::{FuseBackend, FuseSession};
pub use config::MountConfig;
pub use error::{FuseError, FuseResult};
pub use filesystem::BackupFuse;
pub use inode::{InodeTable, ROOT_INODE};
