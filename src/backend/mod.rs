//! The backend driver seam.
//!
//! A [`Backend`] is the source of truth being cached: possibly remote,
//! possibly offline. Drivers only translate; every caching decision lives
//! above, in the coordinator. All calls go through the
//! [`adapter::BackendAdapter`], which refuses to touch a disconnected
//! driver.

pub mod adapter;
pub mod local;

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use nix::errno::Errno;

use crate::store::InodeAttrs;

pub type BackendResult<T> = Result<T, Errno>;

/// One entry of a backend directory listing.
#[derive(Debug, Clone)]
pub struct BackendDirEntry {
    pub name: OsString,
    pub attrs: InodeAttrs,
}

/// Outcome of a backend `readdir`.
///
/// A listing can fail partway through; the entries yielded before the
/// failure are still individually valid, but only a [`Listing::Complete`]
/// may be treated as authoritative for the directory's contents.
#[derive(Debug)]
pub enum Listing {
    Complete(Vec<BackendDirEntry>),
    Interrupted {
        entries: Vec<BackendDirEntry>,
        errno: Errno,
    },
}

/// A backend driver. Implementations are expected to be internally
/// thread-safe; any call may block on network I/O.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Cheap connectivity probe. Must not block on the network.
    fn is_connected(&self) -> bool;

    /// Stat without following a terminal symlink.
    async fn lstat(&self, path: &Path) -> BackendResult<InodeAttrs>;

    async fn readdir(&self, path: &Path) -> BackendResult<Listing>;

    async fn readlink(&self, path: &Path) -> BackendResult<OsString>;

    /// Open for reading. The handle is released by dropping it.
    async fn open(&self, path: &Path) -> BackendResult<Arc<dyn BackendFile>>;
}

/// An open backend file handle.
#[async_trait]
pub trait BackendFile: Send + Sync {
    async fn pread(&self, offset: u64, size: u32) -> BackendResult<Bytes>;
}
