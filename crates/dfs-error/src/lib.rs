#![forbid(unsafe_code)]
//! Error types for dedupfs.
//!
//! Defines `DfsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for FUSE response codes.

use thiserror::Error;

/// Unified error type for all dedupfs operations.
#[derive(Debug, Error)]
pub enum DfsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("file exists")]
    Exists,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("permission denied")]
    PermissionDenied,

    #[error("name too long")]
    NameTooLong,

    #[error("no space left on device")]
    NoSpace,

    #[error("inode table full")]
    NoInode,

    #[error("digest collision on non-identical content")]
    DigestCollision,

    #[error("internal inconsistency: {0}")]
    Internal(String),
}

impl DfsError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::PermissionDenied => libc::EACCES,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::NoSpace | Self::NoInode | Self::DigestCollision => libc::ENOSPC,
            Self::Internal(_) => libc::EIO,
        }
    }
}

/// Result alias using `DfsError`.
pub type Result<T> = std::result::Result<T, DfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(DfsError::NotFound("/x".into()).to_errno(), libc::ENOENT);
        assert_eq!(DfsError::Exists.to_errno(), libc::EEXIST);
        assert_eq!(DfsError::NotDirectory.to_errno(), libc::ENOTDIR);
        assert_eq!(DfsError::IsDirectory.to_errno(), libc::EISDIR);
        assert_eq!(DfsError::NotEmpty.to_errno(), libc::ENOTEMPTY);
        assert_eq!(DfsError::PermissionDenied.to_errno(), libc::EACCES);
        assert_eq!(DfsError::NameTooLong.to_errno(), libc::ENAMETOOLONG);
        assert_eq!(DfsError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(DfsError::NoInode.to_errno(), libc::ENOSPC);
        assert_eq!(DfsError::DigestCollision.to_errno(), libc::ENOSPC);
        assert_eq!(DfsError::Internal("bad".into()).to_errno(), libc::EIO);
    }

    #[test]
    fn display_includes_path() {
        let err = DfsError::NotFound("/a/b".into());
        assert!(err.to_string().contains("/a/b"));
    }
}
