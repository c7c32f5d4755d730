//! FUSE implementation of the [`MountBackend`] trait.

use crate::{BackupFuse, MountConfig};
use fuser::BackgroundSession;
use mbfs_core::mount::MountError;
use mbfs_core::{BackupFilesystem, ManifestOptions, MountBackend, MountSession};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handle to a FUSE-mounted archive.
///
/// Wraps the fuser `BackgroundSession`. Dropping this handle triggers unmount.
pub struct FuseSession {
    session: Option<BackgroundSession>,
    mountpoint: PathBuf,
    bridge: Arc<BackupFilesystem>,
}

impl FuseSession {
    pub fn bridge(&self) -> &Arc<BackupFilesystem> {
        &self.bridge
    }

    /// Ends the FUSE session and makes sure the archive is unmounted.
    ///
    /// The kernel's `destroy` callback normally unmounts the bridge; this
    /// covers sessions that end without one.
    fn shutdown(&mut self) -> Result<(), MountError> {
        if let Some(session) = self.session.take() {
            session.join();
        }
        if self.bridge.is_mounted() {
            let flushed = self.bridge.unmount()?;
            debug!(flushed, "Unmounted archive after session end");
        }
        Ok(())
    }
}

impl MountSession for FuseSession {
    fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    fn unmount(mut self: Box<Self>) -> Result<(), MountError> {
        info!(mountpoint = %self.mountpoint.display(), "Unmounting FUSE filesystem");
        self.shutdown()?;
        info!(mountpoint = %self.mountpoint.display(), "FUSE unmount successful");
        Ok(())
    }
}

impl Drop for FuseSession {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, mountpoint = %self.mountpoint.display(), "Unmount on drop failed");
        }
    }
}

/// FUSE-based mounting backend.
///
/// Uses macFUSE on macOS and the kernel FUSE device on Linux.
#[derive(Debug, Clone, Default)]
pub struct FuseBackend {
    config: MountConfig,
    manifest: ManifestOptions,
}

impl FuseBackend {
    pub fn new(config: MountConfig) -> Self {
        Self {
            config,
            manifest: ManifestOptions::default(),
        }
    }

    /// Sets how the archive's manifest is located and encoded.
    #[must_use]
    pub fn manifest_options(mut self, options: ManifestOptions) -> Self {
        self.manifest = options;
        self
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }
}

impl MountBackend for FuseBackend {
    fn name(&self) -> &'static str {
        "FUSE"
    }

    fn is_available(&self) -> bool {
        self.unavailable_reason().is_none()
    }

    fn unavailable_reason(&self) -> Option<String> {
        #[cfg(target_os = "macos")]
        {
            if !Path::new("/Library/Filesystems/macfuse.fs").exists() {
                return Some(
                    "macFUSE is not installed. Install from https://macfuse.github.io/"
                        .to_string(),
                );
            }
        }
        #[cfg(target_os = "linux")]
        {
            if !Path::new("/dev/fuse").exists() {
                return Some(
                    "/dev/fuse not found. Install fuse3 and load the fuse module.".to_string(),
                );
            }
        }
        None
    }

    fn mount(
        &self,
        archive_dir: &Path,
        mountpoint: &Path,
    ) -> Result<Box<dyn MountSession>, MountError> {
        if let Some(reason) = self.unavailable_reason() {
            return Err(MountError::BackendUnavailable(reason));
        }
        if !mountpoint.is_dir() {
            return Err(MountError::MountPointNotFound(mountpoint.to_path_buf()));
        }

        let bridge = Arc::new(
            BackupFilesystem::new(archive_dir, self.manifest.clone())
                .read_only(self.config.read_only),
        );
        bridge.mount()?;

        let fs = BackupFuse::new(Arc::clone(&bridge), self.config.clone());
        let options = self.config.mount_options();
        let session = match fuser::spawn_mount2(fs, mountpoint, &options) {
            Ok(session) => session,
            Err(e) => {
                if let Err(unmount_err) = bridge.unmount() {
                    warn!(error = %unmount_err, "Failed to unmount archive after mount failure");
                }
                return Err(MountError::Mount(e));
            }
        };

        info!(
            archive = %archive_dir.display(),
            mountpoint = %mountpoint.display(),
            read_only = self.config.read_only,
            "Mounted archive"
        );
        Ok(Box::new(FuseSession {
            session: Some(session),
            mountpoint: mountpoint.to_path_buf(),
            bridge,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_name() {
        assert_eq!(FuseBackend::default().name(), "FUSE");
    }

    #[test]
    fn test_availability_is_consistent() {
        let backend = FuseBackend::default();
        assert_eq!(
            backend.is_available(),
            backend.unavailable_reason().is_none()
        );
    }

    #[test]
    fn test_missing_mountpoint() {
        let backend = FuseBackend::default();
        if !backend.is_available() {
            return;
        }
        let archive = tempfile::tempdir().unwrap();
        let missing = archive.path().join("nowhere");
        let Err(err) = backend.mount(archive.path(), &missing) else {
            panic!("mount should fail");
        };
        assert!(matches!(err, MountError::MountPointNotFound(p) if p == missing));
    }

    #[test]
    fn test_missing_archive_fails_before_mounting() {
        let backend = FuseBackend::default();
        if !backend.is_available() {
            return;
        }
        let archive = tempfile::tempdir().unwrap();
        let mountpoint = tempfile::tempdir().unwrap();
        let Err(err) = backend.mount(archive.path(), mountpoint.path()) else {
            panic!("mount should fail");
        };
        assert!(matches!(err, MountError::Archive(_)));
    }
}
