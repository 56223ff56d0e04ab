//! The filesystem coordinator.
//!
//! Answers kernel-level requests by choosing, per operation, between the
//! backend and the cache:
//!
//! 1. Backend connected: perform the backend operation, persist the result
//!    into the cache, answer from the fresh data.
//! 2. Backend disconnected (or answering `EIO`) and the cache can satisfy
//!    the request: answer from cache.
//! 3. Otherwise: `EIO`.
//!
//! Backend calls happen *outside* transactions; a store transaction only
//! opens once the backend has answered, so one slow network call never
//! stalls other requests on the store.
//!
//! Directory listings carry the `SYNCED` discipline: a directory whose
//! backend listing last completed in full serves `readdir` from cache even
//! while disconnected; any other directory refuses to pretend its cached
//! children are the whole story.

pub mod dirbuf;
pub mod fuser;

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use nix::errno::Errno;
use tracing::{debug, warn};

use crate::backend::adapter::BackendAdapter;
use crate::backend::{Backend, BackendFile, Listing};
use crate::cache::Cache;
use crate::error::{FsError, StoreError};
use crate::store::{validate_name, InodeFlags, InodeKind, InodeRecord};
use crate::ROOT_INO;

pub use dirbuf::{DirBuffer, ReadDirEntry};

/// An opened directory handle, as replied to `opendir`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedDir {
    pub fh: u64,
}

/// An opened file handle, as replied to `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedFile {
    pub fh: u64,
}

#[derive(Clone)]
enum Handle {
    Dir { ino: u64 },
    File { ino: u64, file: Arc<dyn BackendFile> },
}

/// Allocator and registry for kernel file handles.
struct Handles {
    table: scc::HashMap<u64, Handle>,
    next: AtomicU64,
}

impl Handles {
    fn new() -> Self {
        Self {
            table: scc::HashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    fn insert(&self, handle: Handle) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        // fh values are unique by construction
        let _ = self.table.insert(fh, handle);
        fh
    }

    fn get(&self, fh: u64) -> Option<Handle> {
        self.table.read(&fh, |_, handle| handle.clone())
    }

    fn remove(&self, fh: u64) -> Option<Handle> {
        self.table.remove(&fh).map(|(_, handle)| handle)
    }
}

/// The coordinator. One per mount; shared across request tasks.
pub struct Filesystem<B: Backend> {
    cache: Cache,
    backend: BackendAdapter<B>,
    handles: Handles,
}

impl<B: Backend> Filesystem<B> {
    pub fn new(cache: Cache, backend: B) -> Self {
        Self {
            cache,
            backend: BackendAdapter::new(backend),
            handles: Handles::new(),
        }
    }

    /// The cache this coordinator answers from. Exposed for inspection;
    /// mutating it directly while the mount is live is on the caller.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Resolve `name` under `parent`.
    pub async fn lookup(&self, parent: u64, name: &OsStr) -> Result<InodeRecord, FsError> {
        validate_name(name).map_err(|_| FsError::InvalidName)?;

        if self.backend.connected() {
            let path = {
                let txn = self.cache.begin_ro()?;
                txn.path_of(parent)?.join(name)
            };
            match self.backend.lstat(&path).await {
                Ok(attrs) => {
                    let txn = self.cache.begin_rw()?;
                    let ino = txn.emplace(parent, name, &attrs)?;
                    let rec = txn.getattr(ino)?;
                    txn.commit()?;
                    debug!(parent, name = ?name, ino, "lookup refreshed from backend");
                    return Ok(rec);
                }
                Err(Errno::ENOENT) => {
                    // Only a synced parent may shed the stale binding; an
                    // unsynced one cannot tell "deleted" from "unreachable".
                    let txn = self.cache.begin_rw()?;
                    if txn.test_flag(parent, InodeFlags::SYNCED)? {
                        ignore_unbound(txn.remove_entry(parent, name))?;
                    }
                    txn.commit()?;
                    return Err(FsError::NotFound);
                }
                Err(Errno::EIO) => {}
                Err(errno) => return Err(FsError::Backend(errno)),
            }
        }

        let txn = self.cache.begin_ro()?;
        match txn.lookup(parent, name) {
            Ok(ino) => Ok(txn.getattr(ino)?),
            Err(StoreError::NotFound) => Err(FsError::Disconnected),
            Err(e) => Err(e.into()),
        }
    }

    /// Attributes of `ino`, refreshed from the backend when reachable.
    pub async fn getattr(&self, ino: u64) -> Result<InodeRecord, FsError> {
        if self.backend.connected() {
            if ino == ROOT_INO {
                match self.backend.lstat(Path::new("/")).await {
                    Ok(attrs) => {
                        let txn = self.cache.begin_rw()?;
                        match txn.set_attr(ROOT_INO, &attrs) {
                            Ok(()) => {}
                            Err(StoreError::KindMismatch) => {
                                warn!("backend root is not a directory, keeping cached root");
                            }
                            Err(e) => return Err(e.into()),
                        }
                        let rec = txn.getattr(ROOT_INO)?;
                        txn.commit()?;
                        return Ok(rec);
                    }
                    // The mount root must keep answering; fall back to the
                    // cached record on any backend failure.
                    Err(_) => {}
                }
            } else if let Some((parent, name, path)) = self.locate(ino)? {
                match self.backend.lstat(&path).await {
                    Ok(attrs) => {
                        let txn = self.cache.begin_rw()?;
                        let new_ino = txn.emplace(parent, &name, &attrs)?;
                        let result = if new_ino == ino {
                            Ok(txn.getattr(ino)?)
                        } else {
                            // The kind changed under us; the inode the
                            // kernel asked about no longer exists.
                            Err(FsError::NotFound)
                        };
                        txn.commit()?;
                        return result;
                    }
                    Err(Errno::ENOENT) => {
                        let txn = self.cache.begin_rw()?;
                        if txn.test_flag(parent, InodeFlags::SYNCED)? {
                            ignore_unbound(txn.remove_entry(parent, &name))?;
                        }
                        txn.commit()?;
                        return Err(FsError::NotFound);
                    }
                    Err(Errno::EIO) => {}
                    Err(errno) => return Err(FsError::Backend(errno)),
                }
            }
            // No reachable binding for this inode (an orphaned record the
            // kernel still holds): only the cache can answer.
        }

        let txn = self.cache.begin_ro()?;
        match txn.getattr(ino) {
            Ok(rec) => Ok(rec),
            Err(StoreError::NotFound) => Err(FsError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Open a directory. When the backend is reachable this is the sync
    /// point: the full listing is streamed into the cache, entries that
    /// vanished are unbound, and the directory gains `SYNCED`. When it is
    /// not, the open still succeeds; the degraded rules apply at `readdir`.
    pub async fn opendir(&self, ino: u64) -> Result<OpenedDir, FsError> {
        {
            let txn = self.cache.begin_ro()?;
            let rec = txn.getattr(ino)?;
            if rec.kind != InodeKind::Directory {
                return Err(FsError::NotADirectory);
            }
        }

        // An unbound directory the kernel still holds cannot be pathed on
        // the backend; it opens without a sync, like a disconnected one.
        let path = if self.backend.connected() {
            let txn = self.cache.begin_ro()?;
            match txn.path_of(ino) {
                Ok(path) => Some(path),
                Err(StoreError::NotFound) => None,
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };
        if let Some(path) = path {
            match self.backend.readdir(&path).await {
                Ok(Listing::Complete(entries)) => {
                    let txn = self.cache.begin_rw()?;
                    let mut observed = HashSet::with_capacity(entries.len());
                    for entry in &entries {
                        if validate_name(&entry.name).is_err() {
                            warn!(ino, name = ?entry.name, "unusable entry name from backend, skipping");
                            continue;
                        }
                        txn.emplace(ino, &entry.name, &entry.attrs)?;
                        observed.insert(entry.name.clone());
                    }
                    txn.retain_entries(ino, &observed)?;
                    txn.set_flag(ino, InodeFlags::SYNCED, true)?;
                    txn.commit()?;
                    debug!(ino, entries = observed.len(), "directory synced");
                }
                Ok(Listing::Interrupted { entries, errno }) => {
                    // Keep what the backend managed to say, but the synced
                    // claim is off the table: the partial listing may have
                    // grown the entry set beyond the last complete one.
                    let txn = self.cache.begin_rw()?;
                    for entry in &entries {
                        if validate_name(&entry.name).is_err() {
                            continue;
                        }
                        txn.emplace(ino, &entry.name, &entry.attrs)?;
                    }
                    txn.set_flag(ino, InodeFlags::SYNCED, false)?;
                    txn.commit()?;
                    warn!(ino, %errno, "backend listing interrupted, directory left unsynced");
                    if errno != Errno::EIO {
                        return Err(FsError::Backend(errno));
                    }
                }
                Err(Errno::EIO) => {}
                Err(errno) => return Err(FsError::Backend(errno)),
            }
        }

        let fh = self.handles.insert(Handle::Dir { ino });
        Ok(OpenedDir { fh })
    }

    /// List a directory from the cache, resuming strictly after `offset`.
    ///
    /// Offset tokens: `0` is the start; the directory's own inode means
    /// "just past `.`"; the parent's inode means "just past `..`"; a child
    /// inode means "just past that child". An unsynced directory while
    /// disconnected serves the synthetic entries only and answers `EIO` for
    /// anything past them.
    pub fn readdir(
        &self,
        ino: u64,
        size: u32,
        offset: u64,
        fh: u64,
    ) -> Result<Vec<ReadDirEntry>, FsError> {
        match self.handles.get(fh) {
            Some(Handle::Dir { ino: held }) if held == ino => {}
            _ => return Err(FsError::BadHandle),
        }

        let txn = self.cache.begin_ro()?;
        let rec = txn.getattr(ino)?;
        if rec.kind != InodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let parent = if ino == ROOT_INO {
            ROOT_INO
        } else {
            match txn.entry_of(ino) {
                Ok((parent, _)) => parent,
                // Orphaned directory: `..` loops back like the root's does.
                Err(StoreError::NotFound) => ino,
                Err(e) => return Err(e.into()),
            }
        };

        let in_dots = offset == 0 || (offset == ino && ino != parent);
        let synced = rec.flags.contains(InodeFlags::SYNCED);
        let complete = synced || self.backend.connected();
        if !in_dots && !complete {
            return Err(FsError::Disconnected);
        }

        let mut buf = DirBuffer::new(size);
        if offset == 0 {
            buf.push(ReadDirEntry {
                ino,
                offset: ino,
                kind: InodeKind::Directory,
                name: OsString::from("."),
            });
            buf.push(ReadDirEntry {
                ino: parent,
                offset: parent,
                kind: InodeKind::Directory,
                name: OsString::from(".."),
            });
        } else if offset == ino && ino != parent {
            buf.push(ReadDirEntry {
                ino: parent,
                offset: parent,
                kind: InodeKind::Directory,
                name: OsString::from(".."),
            });
        }

        if complete {
            let after = if offset == 0 || offset == ino || offset == parent {
                0
            } else {
                offset
            };
            // Every packed entry costs at least 24 bytes, so this bound
            // always covers one full reply.
            let limit = size as usize / 24 + 2;
            for row in txn.readdir(ino, after, limit)? {
                let accepted = buf.push(ReadDirEntry {
                    ino: row.ino,
                    offset: row.ino,
                    kind: row.kind,
                    name: row.name,
                });
                if !accepted {
                    break;
                }
            }
        }

        Ok(buf.into_entries())
    }

    pub fn releasedir(&self, ino: u64, fh: u64) -> Result<(), FsError> {
        match self.handles.remove(fh) {
            Some(Handle::Dir { ino: held }) if held == ino => Ok(()),
            _ => Err(FsError::BadHandle),
        }
    }

    /// Target of a symlink. A cached target is authoritative (targets only
    /// change by re-creation, which re-allocates the inode), so it is
    /// served without a backend round trip; the first read through a
    /// connected backend persists it for offline use.
    pub async fn readlink(&self, ino: u64) -> Result<OsString, FsError> {
        let cached = {
            let txn = self.cache.begin_ro()?;
            let rec = txn.getattr(ino)?;
            if rec.kind != InodeKind::Link {
                return Err(FsError::NotALink);
            }
            rec.link_target
        };
        if let Some(target) = cached {
            return Ok(target);
        }

        if self.backend.connected() {
            let path = {
                let txn = self.cache.begin_ro()?;
                txn.path_of(ino)?
            };
            match self.backend.readlink(&path).await {
                Ok(target) => {
                    let txn = self.cache.begin_rw()?;
                    match txn.getattr(ino) {
                        Ok(rec) if rec.kind == InodeKind::Link => {
                            let mut attrs = rec.attrs();
                            attrs.link_target = Some(target.clone());
                            txn.set_attr(ino, &attrs)?;
                            txn.commit()?;
                        }
                        // Re-created or unbound in the meantime; serve the
                        // answer without persisting it.
                        Ok(_) | Err(StoreError::NotFound) => {}
                        Err(e) => return Err(e.into()),
                    }
                    return Ok(target);
                }
                Err(Errno::EIO) => {}
                Err(errno) => return Err(FsError::Backend(errno)),
            }
        }

        Err(FsError::Disconnected)
    }

    /// Open a regular file for reading. Content is not cached here, so an
    /// open requires the backend.
    pub async fn open(&self, ino: u64) -> Result<OpenedFile, FsError> {
        let path = {
            let txn = self.cache.begin_ro()?;
            let rec = txn.getattr(ino)?;
            match rec.kind {
                InodeKind::Regular => {}
                InodeKind::Directory => return Err(FsError::IsADirectory),
                InodeKind::Link => return Err(FsError::NotAFile),
            }
            txn.path_of(ino)?
        };

        if !self.backend.connected() {
            return Err(FsError::Disconnected);
        }
        let file = self.backend.open(&path).await.map_err(FsError::Backend)?;
        let fh = self.handles.insert(Handle::File { ino, file });
        Ok(OpenedFile { fh })
    }

    pub async fn read(
        &self,
        ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, FsError> {
        let file = match self.handles.get(fh) {
            Some(Handle::File { ino: held, file }) if held == ino => file,
            _ => return Err(FsError::BadHandle),
        };
        self.backend
            .pread(file.as_ref(), offset, size)
            .await
            .map_err(FsError::Backend)
    }

    pub fn release(&self, ino: u64, fh: u64) -> Result<(), FsError> {
        match self.handles.remove(fh) {
            Some(Handle::File { ino: held, .. }) if held == ino => Ok(()),
            _ => Err(FsError::BadHandle),
        }
    }

    /// The `(parent, name, path)` triple of a bound inode, or `None` when
    /// no binding is reachable (an orphaned record the kernel still holds).
    fn locate(&self, ino: u64) -> Result<Option<(u64, OsString, PathBuf)>, FsError> {
        let txn = self.cache.begin_ro()?;
        match txn.entry_of(ino) {
            Ok((parent, name)) => match txn.path_of(ino) {
                Ok(path) => Ok(Some((parent, name, path))),
                Err(StoreError::NotFound) => Ok(None),
                Err(e) => Err(e.into()),
            },
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Entry removals race with reconciliation; a binding that is already gone
/// is not an error.
fn ignore_unbound(result: Result<(), StoreError>) -> Result<(), StoreError> {
    match result {
        Ok(()) | Err(StoreError::NotFound) => Ok(()),
        Err(e) => Err(e),
    }
}
