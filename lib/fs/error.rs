//! Closed error taxonomy shared by every provider.
//!
//! Errors are classified where they happen (inside a backend or engine), so the mapping to a
//! kernel errno in [`FsError::errno`] is a total match rather than a guess.

use thiserror::Error;

use super::Ino;

/// Every failure a provider can report.
#[derive(Debug, Error)]
pub enum FsError {
    /// Path, inode or name absent.
    #[error("no such file or directory")]
    NotFound,

    /// Generic backend I/O failure.
    #[error("I/O failure")]
    IoFailure(#[source] Option<std::io::Error>),

    /// Access denied by the backend.
    #[error("permission denied")]
    PermissionDenied,

    /// Target name already exists.
    #[error("already exists")]
    AlreadyExists,

    /// A path component is not a directory.
    #[error("not a directory")]
    NotADirectory,

    /// The operation needs a non-directory.
    #[error("is a directory")]
    IsADirectory,

    /// Malformed or contradictory arguments.
    #[error("invalid argument")]
    InvalidArgument,

    /// Backend out of space.
    #[error("no space left on device")]
    NoSpace,

    /// Capability intentionally unimplemented by this provider.
    #[error("operation not supported")]
    NotSupported,

    /// Directory to remove still has entries.
    #[error("directory not empty")]
    NotEmpty,

    /// Handle was never issued or already released.
    #[error("bad file handle {0}")]
    BadFileHandle(u64),

    /// Requested extended attribute does not exist.
    #[error("no such attribute")]
    NoAttribute,

    /// Source and destination live in different backends.
    #[error("cross-device operation")]
    CrossDevice,

    /// Caller's buffer is too small for the reply.
    #[error("result out of range")]
    OutOfRange,

    /// Authentication or framing failure in the encryption layer.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Every member of a fan-out group failed.
    #[error("all members failed")]
    AllMembersFailed,

    /// A majority group got fewer successes than it needs.
    #[error("quorum not reached: {successes} of {required} required")]
    QuorumNotReached {
        /// Members that succeeded.
        successes: usize,
        /// Members that had to succeed.
        required: usize,
    },

    /// Synthetic inode with no registered owner. Indicates an inode table defect.
    #[error("no provider owns inode {0}")]
    ProviderNotFound(Ino),
}

impl FsError {
    /// Generic I/O failure without an underlying cause.
    #[must_use]
    pub const fn io() -> Self {
        Self::IoFailure(None)
    }

    /// The errno this error is reported as.
    #[must_use]
    pub const fn errno(&self) -> Errno {
        let code = match self {
            Self::NotFound => libc::ENOENT,
            Self::PermissionDenied => libc::EACCES,
            Self::AlreadyExists => libc::EEXIST,
            Self::NotADirectory => libc::ENOTDIR,
            Self::IsADirectory => libc::EISDIR,
            Self::InvalidArgument => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotSupported => libc::ENOSYS,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::BadFileHandle(_) => libc::EBADF,
            Self::NoAttribute => ENOATTR,
            Self::OutOfRange => libc::ERANGE,
            Self::CrossDevice => libc::EXDEV,
            Self::IoFailure(_)
            | Self::DecryptionFailed
            | Self::AllMembersFailed
            | Self::QuorumNotReached { .. }
            | Self::ProviderNotFound(_) => libc::EIO,
        };
        Errno(code)
    }

    /// Whether this is [`FsError::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

#[cfg(target_os = "linux")]
const ENOATTR: i32 = libc::ENODATA;
#[cfg(not(target_os = "linux"))]
const ENOATTR: i32 = libc::ENOATTR;

impl From<std::io::Error> for FsError {
    #[expect(
        clippy::wildcard_enum_match_arm,
        reason = "ErrorKind is non_exhaustive; IoFailure is the safe default"
    )]
    fn from(e: std::io::Error) -> Self {
        if let Some(code) = e.raw_os_error() {
            return match code {
                libc::ENOENT => Self::NotFound,
                libc::EACCES | libc::EPERM | libc::EROFS => Self::PermissionDenied,
                libc::EEXIST => Self::AlreadyExists,
                libc::ENOTDIR => Self::NotADirectory,
                libc::EISDIR => Self::IsADirectory,
                libc::EINVAL => Self::InvalidArgument,
                libc::ENOSPC | libc::EDQUOT => Self::NoSpace,
                libc::ENOSYS | libc::EOPNOTSUPP => Self::NotSupported,
                libc::ENOTEMPTY => Self::NotEmpty,
                libc::EBADF => Self::BadFileHandle(0),
                ENOATTR => Self::NoAttribute,
                libc::ERANGE => Self::OutOfRange,
                libc::EXDEV => Self::CrossDevice,
                _ => Self::IoFailure(Some(e)),
            };
        }
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            std::io::ErrorKind::InvalidInput => Self::InvalidArgument,
            std::io::ErrorKind::Unsupported => Self::NotSupported,
            _ => Self::IoFailure(Some(e)),
        }
    }
}

impl From<nix::errno::Errno> for FsError {
    fn from(e: nix::errno::Errno) -> Self {
        std::io::Error::from(e).into()
    }
}

/// A kernel error number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl From<FsError> for Errno {
    fn from(e: FsError) -> Self {
        e.errno()
    }
}

impl From<Errno> for i32 {
    fn from(e: Errno) -> Self {
        e.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composition_failures_map_to_eio() {
        for err in [
            FsError::io(),
            FsError::DecryptionFailed,
            FsError::AllMembersFailed,
            FsError::QuorumNotReached {
                successes: 1,
                required: 2,
            },
            FsError::ProviderNotFound(42),
        ] {
            assert_eq!(err.errno(), Errno(libc::EIO), "{err} should map to EIO");
        }
    }

    #[test]
    fn posix_kinds_map_to_their_errno() {
        assert_eq!(FsError::NotFound.errno(), Errno(libc::ENOENT));
        assert_eq!(FsError::PermissionDenied.errno(), Errno(libc::EACCES));
        assert_eq!(FsError::AlreadyExists.errno(), Errno(libc::EEXIST));
        assert_eq!(FsError::NotADirectory.errno(), Errno(libc::ENOTDIR));
        assert_eq!(FsError::IsADirectory.errno(), Errno(libc::EISDIR));
        assert_eq!(FsError::InvalidArgument.errno(), Errno(libc::EINVAL));
        assert_eq!(FsError::NoSpace.errno(), Errno(libc::ENOSPC));
        assert_eq!(FsError::NotSupported.errno(), Errno(libc::ENOSYS));
    }

    #[test]
    fn io_errors_are_classified_at_the_source() {
        let err: FsError = std::io::Error::from_raw_os_error(libc::ENOTEMPTY).into();
        assert!(matches!(err, FsError::NotEmpty));

        let err: FsError = std::io::Error::other("boom").into();
        assert!(matches!(err, FsError::IoFailure(Some(_))));
    }
}
