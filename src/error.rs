//! Error taxonomy, mapped to errnos at the kernel boundary.

use nix::errno::Errno;
use thiserror::Error;

/// Failures raised by the persistent inode store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such inode or entry")]
    NotFound,

    #[error("inode is not a symlink")]
    NotALink,

    #[error("inode is not a directory")]
    NotADirectory,

    #[error("invalid entry name")]
    InvalidName,

    /// `set_attr` observed a kind change. Callers re-run the update through
    /// `emplace`, which re-allocates; this never reaches the kernel.
    #[error("inode kind changed")]
    KindMismatch,

    /// Existing store contents violate structural invariants. Fatal: the
    /// mount must not come up on top of a store it cannot trust.
    #[error("cache store is corrupt: {0}")]
    Corrupt(String),

    #[error("cache store i/o error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("cache store i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures raised by the filesystem coordinator.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such inode or entry")]
    NotFound,

    /// The backend is unreachable and the cache cannot answer.
    #[error("backend unreachable and cache insufficient")]
    Disconnected,

    #[error("inode is not a directory")]
    NotADirectory,

    #[error("inode is a directory")]
    IsADirectory,

    #[error("inode is not a symlink")]
    NotALink,

    #[error("inode is not a regular file")]
    NotAFile,

    #[error("invalid entry name")]
    InvalidName,

    #[error("stale or foreign file handle")]
    BadHandle,

    #[error("backend error: {0}")]
    Backend(Errno),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<FsError> for i32 {
    fn from(e: FsError) -> Self {
        match e {
            FsError::NotFound => libc::ENOENT,
            FsError::Disconnected => libc::EIO,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NotALink | FsError::NotAFile | FsError::InvalidName => libc::EINVAL,
            FsError::BadHandle => libc::EBADF,
            FsError::Backend(errno) => errno as i32,
            FsError::Store(store) => match store {
                StoreError::NotFound => libc::ENOENT,
                StoreError::NotALink | StoreError::InvalidName => libc::EINVAL,
                StoreError::NotADirectory => libc::ENOTDIR,
                StoreError::KindMismatch
                | StoreError::Corrupt(_)
                | StoreError::Db(_)
                | StoreError::Io(_) => libc::EIO,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_the_kernel_vocabulary() {
        assert_eq!(i32::from(FsError::NotFound), libc::ENOENT);
        assert_eq!(i32::from(FsError::Disconnected), libc::EIO);
        assert_eq!(i32::from(FsError::NotADirectory), libc::ENOTDIR);
        assert_eq!(i32::from(FsError::IsADirectory), libc::EISDIR);
        assert_eq!(i32::from(FsError::InvalidName), libc::EINVAL);
        assert_eq!(i32::from(FsError::Backend(Errno::EACCES)), libc::EACCES);
        assert_eq!(
            i32::from(FsError::Store(StoreError::NotFound)),
            libc::ENOENT
        );
    }
}
