#![allow(missing_docs, clippy::unwrap_used, dead_code)]

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use nix::errno::Errno;
use tempfile::TempDir;

use stashfs::backend::{Backend, BackendDirEntry, BackendFile, BackendResult, Listing};
use stashfs::cache::Cache;
use stashfs::fs::Filesystem;
use stashfs::store::{InodeAttrs, InodeKind};

pub fn default_timestamp() -> SystemTime {
    UNIX_EPOCH + Duration::new(1_536_390_000, 20_180_908)
}

pub fn default_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

pub fn default_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

pub fn attrs(kind: InodeKind, perm: u32) -> InodeAttrs {
    InodeAttrs {
        kind,
        perm,
        uid: default_uid(),
        gid: default_gid(),
        size: 0,
        atime: default_timestamp(),
        mtime: default_timestamp(),
        ctime: default_timestamp(),
        link_target: None,
    }
}

pub fn file_attrs() -> InodeAttrs {
    attrs(InodeKind::Regular, 0o640)
}

pub fn dir_attrs() -> InodeAttrs {
    attrs(InodeKind::Directory, 0o750)
}

struct MemNode {
    attrs: InodeAttrs,
    content: Bytes,
    target: Option<OsString>,
}

#[derive(Default)]
struct MemoryState {
    nodes: Mutex<HashMap<PathBuf, MemNode>>,
    connected: AtomicBool,
    /// When set, `readdir` yields this many entries and then fails.
    readdir_fault: Mutex<Option<(usize, Errno)>>,
}

/// An in-memory backend with a connectivity switch and listing fault
/// injection. Clones share state.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let backend = Self {
            state: Arc::new(MemoryState::default()),
        };
        backend.state.connected.store(true, Ordering::SeqCst);
        backend.state.nodes.lock().unwrap().insert(
            PathBuf::from("/"),
            MemNode {
                attrs: attrs(InodeKind::Directory, 0o755),
                content: Bytes::new(),
                target: None,
            },
        );
        backend
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.connected.store(connected, Ordering::SeqCst);
    }

    pub fn put_file(&self, path: &str, attrs: InodeAttrs) {
        self.put(path, attrs, Bytes::new(), None);
    }

    pub fn put_file_with_content(&self, path: &str, attrs: InodeAttrs, content: &'static [u8]) {
        self.put(path, attrs, Bytes::from_static(content), None);
    }

    pub fn put_dir(&self, path: &str, attrs: InodeAttrs) {
        self.put(path, attrs, Bytes::new(), None);
    }

    pub fn put_link(&self, path: &str, target: &str, mut attrs: InodeAttrs) {
        attrs.kind = InodeKind::Link;
        self.put(path, attrs, Bytes::new(), Some(OsString::from(target)));
    }

    /// Drop `path` and everything under it.
    pub fn remove(&self, path: &str) {
        let mut nodes = self.state.nodes.lock().unwrap();
        let prefix = PathBuf::from(path);
        nodes.retain(|p, _| p != &prefix && !p.starts_with(&prefix));
    }

    pub fn fail_readdir_after(&self, yielded: usize, errno: Errno) {
        *self.state.readdir_fault.lock().unwrap() = Some((yielded, errno));
    }

    pub fn clear_readdir_fault(&self) {
        *self.state.readdir_fault.lock().unwrap() = None;
    }

    fn put(&self, path: &str, mut attrs: InodeAttrs, content: Bytes, target: Option<OsString>) {
        attrs.size = target
            .as_ref()
            .map_or(content.len() as u64, |t| t.len() as u64);
        self.state.nodes.lock().unwrap().insert(
            PathBuf::from(path),
            MemNode {
                attrs,
                content,
                target,
            },
        );
    }

    fn children_of(&self, dir: &Path) -> Vec<BackendDirEntry> {
        let nodes = self.state.nodes.lock().unwrap();
        let mut entries: Vec<BackendDirEntry> = nodes
            .iter()
            .filter(|(path, _)| path.parent() == Some(dir))
            .map(|(path, node)| BackendDirEntry {
                name: path.file_name().unwrap().to_owned(),
                attrs: node.attrs.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn lstat(&self, path: &Path) -> BackendResult<InodeAttrs> {
        let nodes = self.state.nodes.lock().unwrap();
        nodes
            .get(path)
            .map(|node| node.attrs.clone())
            .ok_or(Errno::ENOENT)
    }

    async fn readdir(&self, path: &Path) -> BackendResult<Listing> {
        {
            let nodes = self.state.nodes.lock().unwrap();
            let node = nodes.get(path).ok_or(Errno::ENOENT)?;
            if node.attrs.kind != InodeKind::Directory {
                return Err(Errno::ENOTDIR);
            }
        }
        let mut entries = self.children_of(path);
        if let Some((yielded, errno)) = *self.state.readdir_fault.lock().unwrap() {
            entries.truncate(yielded);
            return Ok(Listing::Interrupted { entries, errno });
        }
        Ok(Listing::Complete(entries))
    }

    async fn readlink(&self, path: &Path) -> BackendResult<OsString> {
        let nodes = self.state.nodes.lock().unwrap();
        let node = nodes.get(path).ok_or(Errno::ENOENT)?;
        node.target.clone().ok_or(Errno::EINVAL)
    }

    async fn open(&self, path: &Path) -> BackendResult<Arc<dyn BackendFile>> {
        let nodes = self.state.nodes.lock().unwrap();
        let node = nodes.get(path).ok_or(Errno::ENOENT)?;
        if node.attrs.kind != InodeKind::Regular {
            return Err(Errno::EISDIR);
        }
        Ok(Arc::new(MemoryFile {
            data: node.content.clone(),
        }))
    }
}

struct MemoryFile {
    data: Bytes,
}

#[async_trait]
impl BackendFile for MemoryFile {
    async fn pread(&self, offset: u64, size: u32) -> BackendResult<Bytes> {
        let start = (offset as usize).min(self.data.len());
        let end = (start + size as usize).min(self.data.len());
        Ok(self.data.slice(start..end))
    }
}

pub struct TestEnv {
    _cache_dir: TempDir,
    pub backend: MemoryBackend,
    pub fs: Filesystem<MemoryBackend>,
}

impl TestEnv {
    pub fn new() -> Self {
        let cache_dir = TempDir::new().expect("temp cache dir");
        let cache = Cache::open(cache_dir.path()).expect("cache open");
        let backend = MemoryBackend::new();
        let fs = Filesystem::new(cache, backend.clone());
        Self {
            _cache_dir: cache_dir,
            backend,
            fs,
        }
    }

    /// The contents every scenario starts from: a file, a directory with
    /// two files, and a symlink inside that directory.
    pub fn with_default_contents() -> Self {
        let env = Self::new();
        env.backend.put_file("/README.md", file_attrs());
        env.backend.put_dir("/books", dir_attrs());
        env.backend
            .put_file("/books/Hitchhiker's Guide To The Galaxy.epub", file_attrs());
        env.backend
            .put_file("/books/The Elements of Style.epub", file_attrs());
        env.backend.put_link(
            "/books/best.epub",
            "Hitchhiker's Guide To The Galaxy.epub",
            file_attrs(),
        );
        env
    }

    pub fn cache(&self) -> &Cache {
        self.fs.cache()
    }
}
