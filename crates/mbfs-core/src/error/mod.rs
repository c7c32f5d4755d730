//! Error types of the crate and their classification.
//!
//! Each layer has its own `thiserror` enum. [`ErrorCategory`] folds all of
//! them into the small vocabulary a mount collaborator needs, so every error
//! can become a POSIX errno without the caller matching on variants.

pub use crate::backup::{KeyError, ManifestContext, ManifestError};
pub use crate::crypto::CipherError;
pub use crate::cursor::CursorError;
pub use crate::fs::{FileContext, FileError};

/// Broad class of a failure.
///
/// # Example
///
/// ```
/// use mbfs_core::{EntryKey, ErrorCategory, ManifestError};
///
/// let err = ManifestError::NotFound { key: EntryKey::root() };
/// let category = ErrorCategory::from(&err);
/// assert_eq!(category, ErrorCategory::NotFound);
/// assert_eq!(category.to_errno(), libc::ENOENT);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Resource not found (ENOENT)
    NotFound,
    /// Resource already exists (EEXIST)
    AlreadyExists,
    /// Directory not empty (ENOTEMPTY)
    NotEmpty,
    /// Expected a file, found a directory (EISDIR)
    IsDirectory,
    /// Expected a directory, found something else (ENOTDIR)
    NotDirectory,
    /// Invalid name, offset or argument (EINVAL)
    InvalidArgument,
    /// Storage, format or cipher failure (EIO)
    IoError,
    /// Operation forbidden by the handle mode (EACCES)
    PermissionDenied,
    /// Write to a read-only mount (EROFS)
    ReadOnlyFilesystem,
    /// Operation not supported (ENOTSUP)
    NotSupported,
    /// Unknown or closed file handle (EBADF)
    BadHandle,
}

impl ErrorCategory {
    /// Converts this category to a POSIX errno value.
    #[inline]
    pub fn to_errno(self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::AlreadyExists => libc::EEXIST,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::IsDirectory => libc::EISDIR,
            Self::NotDirectory => libc::ENOTDIR,
            Self::InvalidArgument => libc::EINVAL,
            Self::IoError => libc::EIO,
            Self::PermissionDenied => libc::EACCES,
            Self::ReadOnlyFilesystem => libc::EROFS,
            Self::NotSupported => libc::ENOTSUP,
            Self::BadHandle => libc::EBADF,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::NotEmpty => "NotEmpty",
            Self::IsDirectory => "IsDirectory",
            Self::NotDirectory => "NotDirectory",
            Self::InvalidArgument => "InvalidArgument",
            Self::IoError => "IoError",
            Self::PermissionDenied => "PermissionDenied",
            Self::ReadOnlyFilesystem => "ReadOnlyFilesystem",
            Self::NotSupported => "NotSupported",
            Self::BadHandle => "BadHandle",
        }
    }
}

impl From<&KeyError> for ErrorCategory {
    fn from(_: &KeyError) -> Self {
        Self::InvalidArgument
    }
}

impl From<&ManifestError> for ErrorCategory {
    fn from(e: &ManifestError) -> Self {
        match e {
            ManifestError::NotFound { .. } => Self::NotFound,
            ManifestError::DuplicateKey { .. } => Self::AlreadyExists,
            ManifestError::NotADirectory { .. } => Self::NotDirectory,
            ManifestError::InvalidIdentity(_) | ManifestError::Unencodable { .. } => {
                Self::InvalidArgument
            }
            ManifestError::CorruptManifest { .. }
            | ManifestError::UnsupportedVersion { .. }
            | ManifestError::WriteFailed { .. }
            | ManifestError::Io { .. } => Self::IoError,
        }
    }
}

impl From<&FileError> for ErrorCategory {
    fn from(e: &FileError) -> Self {
        match e {
            FileError::NotFound { .. } => Self::NotFound,
            FileError::AlreadyExists { .. } => Self::AlreadyExists,
            FileError::OutOfRange { .. } => Self::InvalidArgument,
            FileError::InvalidHandle { .. } => Self::BadHandle,
            FileError::ReadOnlyHandle { .. } => Self::PermissionDenied,
            FileError::NotAFile { .. } => Self::IsDirectory,
            FileError::IoFault { .. } | FileError::CorruptCipherState { .. } => Self::IoError,
            FileError::Manifest(inner) => Self::from(inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntryKey;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(ErrorCategory::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(ErrorCategory::NotEmpty.to_errno(), libc::ENOTEMPTY);
        assert_eq!(ErrorCategory::BadHandle.to_errno(), libc::EBADF);
        assert_eq!(ErrorCategory::NotSupported.name(), "NotSupported");
    }

    #[test]
    fn test_manifest_categories() {
        let key = EntryKey::new("D", "a").unwrap();
        assert_eq!(
            ErrorCategory::from(&ManifestError::DuplicateKey { key: key.clone() }),
            ErrorCategory::AlreadyExists
        );
        assert_eq!(
            ErrorCategory::from(&ManifestError::NotADirectory { key }),
            ErrorCategory::NotDirectory
        );
        assert_eq!(
            ErrorCategory::from(&ManifestError::CorruptManifest {
                offset: 0,
                reason: String::new()
            }),
            ErrorCategory::IoError
        );
    }

    #[test]
    fn test_file_categories() {
        assert_eq!(
            ErrorCategory::from(&FileError::InvalidHandle {
                context: FileContext::new()
            }),
            ErrorCategory::BadHandle
        );
        assert_eq!(
            ErrorCategory::from(&FileError::ReadOnlyHandle {
                context: FileContext::new()
            }),
            ErrorCategory::PermissionDenied
        );
        let nested = FileError::Manifest(ManifestError::NotFound {
            key: EntryKey::root(),
        });
        assert_eq!(ErrorCategory::from(&nested), ErrorCategory::NotFound);
    }
}
