//! Error handling and mapping for the FUSE filesystem.
//!
//! Bridge errors already carry an [`ErrorCategory`](mbfs_core::ErrorCategory);
//! this module adds the failures that only exist at the FUSE layer and turns
//! everything into an errno for the kernel.

use mbfs_core::BridgeError;
use std::io;
use thiserror::Error;

/// FUSE-specific errors that can occur during filesystem operations.
#[derive(Debug, Error)]
pub enum FuseError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// The kernel passed an inode this table does not know.
    #[error("Invalid inode: {0}")]
    InvalidInode(u64),

    /// A name that is not valid UTF-8.
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// The destination of a no-replace rename exists.
    #[error("Destination exists")]
    Exists,

    /// Negative offset or other bad request argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for FUSE operations.
pub type FuseResult<T> = Result<T, FuseError>;

/// Conversion to the errno replied to the kernel.
pub trait ToErrno {
    fn to_errno(&self) -> i32;
}

impl ToErrno for FuseError {
    fn to_errno(&self) -> i32 {
        match self {
            FuseError::Bridge(e) => e.to_errno(),
            FuseError::InvalidInode(_) => libc::ENOENT,
            FuseError::Exists => libc::EEXIST,
            FuseError::InvalidName(_) | FuseError::InvalidArgument(_) => libc::EINVAL,
            FuseError::Io(e) => io_error_to_errno(e),
        }
    }
}

/// Raw OS error if there is one, otherwise EIO.
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}
