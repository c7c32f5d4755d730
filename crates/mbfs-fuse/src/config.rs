//! Mount configuration for the FUSE filesystem.

use fuser::MountOption;
use std::time::Duration;

/// Default attribute TTL. The manifest only changes through this mount, so
/// the kernel may cache for a while.
pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(1);

/// Configuration options for the FUSE filesystem.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Time-to-live for attributes and entries cached by the kernel.
    pub attr_ttl: Duration,

    /// Refuse every modification.
    pub read_only: bool,

    /// Let other users access the mount (needs `user_allow_other` in
    /// `/etc/fuse.conf`).
    pub allow_other: bool,

    /// Filesystem name shown in the mount table.
    pub fs_name: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            attr_ttl: DEFAULT_ATTR_TTL,
            read_only: false,
            allow_other: false,
            fs_name: "mbfs".to_string(),
        }
    }
}

impl MountConfig {
    /// Sets the cache TTL for attributes and entries.
    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub fn allow_other(mut self, allow_other: bool) -> Self {
        self.allow_other = allow_other;
        self
    }

    #[must_use]
    pub fn fs_name(mut self, name: impl Into<String>) -> Self {
        self.fs_name = name.into();
        self
    }

    /// fuser mount options for this configuration.
    pub fn mount_options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(self.fs_name.clone()),
            MountOption::Subtype("mbfs".to_string()),
            MountOption::AutoUnmount,
            MountOption::DefaultPermissions,
        ];

        #[cfg(target_os = "macos")]
        options.push(MountOption::CUSTOM(format!("volname={}", self.fs_name)));

        options.push(if self.read_only {
            MountOption::RO
        } else {
            MountOption::RW
        });
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        options
    }
}
