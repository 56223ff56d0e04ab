//! Inode records and the value types persisted with them.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt as _;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

use crate::error::StoreError;

/// What kind of filesystem object an inode is. Immutable for the lifetime
/// of the inode; a kind change observed on the backend forces a new inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InodeKind {
    Regular,
    Directory,
    Link,
}

impl InodeKind {
    /// Persisted discriminant.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Regular => 1,
            Self::Directory => 2,
            Self::Link => 3,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Regular),
            2 => Some(Self::Directory),
            3 => Some(Self::Link),
            _ => None,
        }
    }

    /// The `S_IFMT` bits for this kind.
    pub fn ifmt(self) -> u32 {
        match self {
            Self::Regular => libc::S_IFREG,
            Self::Directory => libc::S_IFDIR,
            Self::Link => libc::S_IFLNK,
        }
    }
}

bitflags! {
    /// Per-inode boolean attributes. Unknown bits are preserved on
    /// read-modify-write so newer stores stay readable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InodeFlags: u32 {
        /// The directory's cached children are the complete listing as last
        /// observed from the backend.
        const SYNCED = 1 << 0;

        const _ = !0;
    }
}

/// The attributes applied to an inode by `emplace` / `set_attr`. This is
/// also what the backend reports for an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeAttrs {
    pub kind: InodeKind,
    /// Permission and special bits (the low 12 bits of `st_mode`).
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Only meaningful for `InodeKind::Link`. `None` means "not yet read".
    pub link_target: Option<OsString>,
}

/// A persisted inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRecord {
    pub ino: u64,
    pub kind: InodeKind,
    /// Full `st_mode`: type bits composed with permission bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub flags: InodeFlags,
    pub link_target: Option<OsString>,
}

impl InodeRecord {
    /// The attribute view of this record, e.g. for re-persisting with one
    /// field changed.
    pub fn attrs(&self) -> InodeAttrs {
        InodeAttrs {
            kind: self.kind,
            perm: self.mode & 0o7777,
            uid: self.uid,
            gid: self.gid,
            size: self.size,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            link_target: self.link_target.clone(),
        }
    }
}

/// Longest accepted entry name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Validate a directory entry name: non-empty, at most [`MAX_NAME_LEN`]
/// bytes, no `/` or NUL, not `.` or `..`.
pub fn validate_name(name: &OsStr) -> Result<(), StoreError> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LEN {
        return Err(StoreError::InvalidName);
    }
    if bytes == b"." || bytes == b".." {
        return Err(StoreError::InvalidName);
    }
    if bytes.iter().any(|&b| b == b'/' || b == 0) {
        return Err(StoreError::InvalidName);
    }
    Ok(())
}

/// Split a `SystemTime` into the persisted `(sec, nsec)` pair. Pre-epoch
/// times land on negative seconds with nsec in `[0, 999_999_999]`.
pub fn systime_to_raw(t: SystemTime) -> (i64, u32) {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(e) => {
            let before = e.duration();
            let nsec = before.subsec_nanos();
            if nsec == 0 {
                (-(before.as_secs() as i64), 0)
            } else {
                (-(before.as_secs() as i64) - 1, 1_000_000_000 - nsec)
            }
        }
    }
}

/// Inverse of [`systime_to_raw`].
pub fn raw_to_systime(sec: i64, nsec: u32) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec)
    } else {
        UNIX_EPOCH - Duration::from_secs(sec.unsigned_abs()) + Duration::from_nanos(u64::from(nsec))
    }
}
