//! The external mount collaborator.
//!
//! A [`MountBackend`] turns a [`BackupFilesystem`](super::BackupFilesystem)
//! into a live mount; the returned [`MountSession`] controls how long it
//! lives. Backends live in their own crates (`mbfs-fuse` for FUSE).

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::bridge::BridgeError;

#[derive(Error, Debug)]
pub enum MountError {
    /// The archive could not be loaded
    #[error("Failed to open archive: {0}")]
    Archive(#[from] BridgeError),

    #[error("Failed to mount: {0}")]
    Mount(#[from] std::io::Error),

    #[error("Mount point does not exist: {0}")]
    MountPointNotFound(PathBuf),

    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    #[error("Unmount failed: {0}")]
    UnmountFailed(String),
}

/// A live mount.
///
/// Dropping the session must unmount as well, so a mount never outlives its
/// owner.
pub trait MountSession: Send {
    fn mountpoint(&self) -> &Path;

    /// Unmount, flushing the manifest if it changed.
    fn unmount(self: Box<Self>) -> Result<(), MountError>;
}

/// A mechanism that can expose an archive as a mounted filesystem.
pub trait MountBackend: Send + Sync {
    /// Human-readable name, e.g. "FUSE".
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    /// Why the backend cannot be used, or `None` if it can.
    fn unavailable_reason(&self) -> Option<String>;

    /// Mount the archive at `archive_dir` on `mountpoint`.
    fn mount(
        &self,
        archive_dir: &Path,
        mountpoint: &Path,
    ) -> Result<Box<dyn MountSession>, MountError>;
}
