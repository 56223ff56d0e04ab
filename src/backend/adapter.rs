//! Connectivity gate in front of a backend driver.
//!
//! Every operation checks [`Backend::is_connected`] first and synthesizes
//! `EIO` locally when the backend is away, so a dead link costs a flag read
//! instead of a network timeout.

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use nix::errno::Errno;

use super::{Backend, BackendFile, BackendResult, Listing};

pub struct BackendAdapter<B> {
    inner: Arc<B>,
}

impl<B> Clone for BackendAdapter<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> BackendAdapter<B> {
    pub fn new(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    pub fn connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn gate(&self) -> BackendResult<()> {
        if self.connected() {
            Ok(())
        } else {
            Err(Errno::EIO)
        }
    }

    pub async fn lstat(&self, path: &Path) -> BackendResult<crate::store::InodeAttrs> {
        self.gate()?;
        self.inner.lstat(path).await
    }

    pub async fn readdir(&self, path: &Path) -> BackendResult<Listing> {
        self.gate()?;
        self.inner.readdir(path).await
    }

    pub async fn readlink(&self, path: &Path) -> BackendResult<OsString> {
        self.gate()?;
        self.inner.readlink(path).await
    }

    pub async fn open(&self, path: &Path) -> BackendResult<Arc<dyn BackendFile>> {
        self.gate()?;
        self.inner.open(path).await
    }

    pub async fn pread(
        &self,
        file: &dyn BackendFile,
        offset: u64,
        size: u32,
    ) -> BackendResult<Bytes> {
        self.gate()?;
        file.pread(offset, size).await
    }
}
