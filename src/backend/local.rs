//! A passthrough driver over a directory on the host.
//!
//! Useful in its own right for caching slow or flaky mounts (NFS, sshfs):
//! connectivity is probed by statting the backend root, so an unmounted
//! share reads as "disconnected" rather than hanging every request.

use std::ffi::OsString;
use std::fs::Metadata;
use std::os::unix::fs::{FileExt as _, MetadataExt as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use nix::errno::Errno;
use tracing::warn;

use crate::store::{raw_to_systime, InodeAttrs, InodeKind};

use super::{Backend, BackendDirEntry, BackendFile, BackendResult, Listing};

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Map a backend-absolute path onto the host tree.
    fn resolve(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("/") {
            Ok(rel) => self.root.join(rel),
            Err(_) => self.root.join(path),
        }
    }
}

fn errno_of(e: &std::io::Error) -> Errno {
    Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO))
}

/// Run a blocking filesystem call off the async worker threads.
async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, std::io::Error> + Send + 'static,
) -> BackendResult<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|_| Errno::EIO)?
        .map_err(|e| errno_of(&e))
}

fn attrs_of(meta: &Metadata) -> Option<InodeAttrs> {
    let ft = meta.file_type();
    let kind = if ft.is_dir() {
        InodeKind::Directory
    } else if ft.is_file() {
        InodeKind::Regular
    } else if ft.is_symlink() {
        InodeKind::Link
    } else {
        // Sockets, fifos and device nodes are not projected.
        return None;
    };
    Some(InodeAttrs {
        kind,
        perm: meta.mode() & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.len(),
        atime: raw_to_systime(meta.atime(), meta.atime_nsec() as u32),
        mtime: raw_to_systime(meta.mtime(), meta.mtime_nsec() as u32),
        ctime: raw_to_systime(meta.ctime(), meta.ctime_nsec() as u32),
        link_target: None,
    })
}

#[async_trait]
impl Backend for LocalBackend {
    fn is_connected(&self) -> bool {
        self.root.symlink_metadata().map(|m| m.is_dir()).unwrap_or(false)
    }

    async fn lstat(&self, path: &Path) -> BackendResult<InodeAttrs> {
        let target = self.resolve(path);
        let meta = blocking(move || target.symlink_metadata()).await?;
        attrs_of(&meta).ok_or(Errno::ENOTSUP)
    }

    async fn readdir(&self, path: &Path) -> BackendResult<Listing> {
        let target = self.resolve(path);
        blocking(move || {
            let mut entries = Vec::new();
            let iter = std::fs::read_dir(&target)?;
            for item in iter {
                let item = match item {
                    Ok(item) => item,
                    Err(e) => {
                        warn!(dir = %target.display(), error = %e, "listing interrupted");
                        return Ok(Listing::Interrupted {
                            entries,
                            errno: errno_of(&e),
                        });
                    }
                };
                let meta = match item.path().symlink_metadata() {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!(dir = %target.display(), error = %e, "listing interrupted");
                        return Ok(Listing::Interrupted {
                            entries,
                            errno: errno_of(&e),
                        });
                    }
                };
                if let Some(attrs) = attrs_of(&meta) {
                    entries.push(BackendDirEntry {
                        name: item.file_name(),
                        attrs,
                    });
                }
            }
            Ok(Listing::Complete(entries))
        })
        .await
    }

    async fn readlink(&self, path: &Path) -> BackendResult<OsString> {
        let target = self.resolve(path);
        blocking(move || std::fs::read_link(&target))
            .await
            .map(PathBuf::into_os_string)
    }

    async fn open(&self, path: &Path) -> BackendResult<Arc<dyn BackendFile>> {
        let target = self.resolve(path);
        let file = blocking(move || std::fs::File::open(&target)).await?;
        Ok(Arc::new(LocalFile {
            file: Arc::new(file),
        }))
    }
}

struct LocalFile {
    file: Arc<std::fs::File>,
}

#[async_trait]
impl BackendFile for LocalFile {
    async fn pread(&self, offset: u64, size: u32) -> BackendResult<Bytes> {
        let file = Arc::clone(&self.file);
        blocking(move || {
            let mut buf = vec![0u8; size as usize];
            let n = file.read_at(&mut buf, offset)?;
            buf.truncate(n);
            Ok(Bytes::from(buf))
        })
        .await
    }
}
