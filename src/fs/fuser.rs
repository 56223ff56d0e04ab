//! Glue between the coordinator and the fuser session.
//!
//! Each kernel request is spawned as its own task on the runtime, so a
//! request blocked on the backend never holds up its neighbours. Exactly
//! one reply is issued per request: the `Ok` reply on success, the mapped
//! errno otherwise.

use std::ffi::OsStr;
use std::future::Future;
use std::os::unix::ffi::OsStrExt as _;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument as _;
use tracing::debug;

use crate::backend::Backend;
use crate::store::{InodeKind, InodeRecord};

use super::Filesystem;

/// How long the kernel may cache replied attributes and entries. Kept
/// short: the backend can change underneath us without notification.
const ATTR_TTL: Duration = Duration::from_secs(1);

fn file_type_of(kind: InodeKind) -> fuser::FileType {
    match kind {
        InodeKind::Regular => fuser::FileType::RegularFile,
        InodeKind::Directory => fuser::FileType::Directory,
        InodeKind::Link => fuser::FileType::Symlink,
    }
}

fn attr_of(rec: &InodeRecord) -> fuser::FileAttr {
    fuser::FileAttr {
        ino: rec.ino,
        size: rec.size,
        blocks: rec.size.div_ceil(512),
        atime: rec.atime,
        mtime: rec.mtime,
        ctime: rec.ctime,
        crtime: rec.ctime,
        kind: file_type_of(rec.kind),
        perm: (rec.mode & 0o7777) as u16,
        nlink: if rec.kind == InodeKind::Directory { 2 } else { 1 },
        uid: rec.uid,
        gid: rec.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

pub struct FuseDriver<B: Backend> {
    fs: Arc<Filesystem<B>>,
    runtime: tokio::runtime::Handle,
}

impl<B: Backend> FuseDriver<B> {
    pub fn new(fs: Filesystem<B>, runtime: tokio::runtime::Handle) -> Self {
        Self {
            fs: Arc::new(fs),
            runtime,
        }
    }

    fn spawn<Fut>(
        &self,
        span: tracing::Span,
        f: impl FnOnce(Arc<Filesystem<B>>) -> Fut + Send + 'static,
    ) where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        self.runtime.spawn(f(fs).instrument(span));
    }
}

impl<B: Backend> fuser::Filesystem for FuseDriver<B> {
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let name = name.to_owned();
        let span = tracing::debug_span!("FuseDriver::lookup", parent, ?name);
        self.spawn(span, move |fs| async move {
            match fs.lookup(parent, &name).await {
                Ok(rec) => reply.entry(&ATTR_TTL, &attr_of(&rec), 0),
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(e.into());
                }
            }
        });
    }

    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let span = tracing::debug_span!("FuseDriver::getattr", ino);
        self.spawn(span, move |fs| async move {
            match fs.getattr(ino).await {
                Ok(rec) => reply.attr(&ATTR_TTL, &attr_of(&rec)),
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(e.into());
                }
            }
        });
    }

    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        let span = tracing::debug_span!("FuseDriver::readlink", ino);
        self.spawn(span, move |fs| async move {
            match fs.readlink(ino).await {
                Ok(target) => reply.data(target.as_bytes()),
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(e.into());
                }
            }
        });
    }

    fn opendir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _flags: i32,
        reply: fuser::ReplyOpen,
    ) {
        let span = tracing::debug_span!("FuseDriver::opendir", ino);
        self.spawn(span, move |fs| async move {
            match fs.opendir(ino).await {
                Ok(opened) => reply.opened(opened.fh, 0),
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(e.into());
                }
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let span = tracing::debug_span!("FuseDriver::readdir", ino, offset);
        self.spawn(span, move |fs| async move {
            // One kernel readdir reply is never larger than this.
            const REPLY_SIZE: u32 = 128 * 1024;
            let entries = match fs.readdir(ino, REPLY_SIZE, offset.cast_unsigned(), fh) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(e.into());
                    return;
                }
            };
            for entry in entries {
                let full = reply.add(
                    entry.ino,
                    entry.offset.cast_signed(),
                    file_type_of(entry.kind),
                    &entry.name,
                );
                if full {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        let span = tracing::debug_span!("FuseDriver::releasedir", ino, fh);
        self.spawn(span, move |fs| async move {
            match fs.releasedir(ino, fh) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.into()),
            }
        });
    }

    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        // The overlay is read-only towards the user.
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            reply.error(libc::EACCES);
            return;
        }
        let span = tracing::debug_span!("FuseDriver::open", ino);
        self.spawn(span, move |fs| async move {
            match fs.open(ino).await {
                Ok(opened) => reply.opened(opened.fh, 0),
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(e.into());
                }
            }
        });
    }

    #[expect(clippy::too_many_arguments, reason = "mirrors fuser read API")]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let span = tracing::debug_span!("FuseDriver::read", ino, offset, size);
        self.spawn(span, move |fs| async move {
            match fs.read(ino, fh, offset.cast_unsigned(), size).await {
                Ok(data) => reply.data(&data),
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(e.into());
                }
            }
        });
    }

    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let span = tracing::debug_span!("FuseDriver::release", ino, fh);
        self.spawn(span, move |fs| async move {
            match fs.release(ino, fh) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.into()),
            }
        });
    }
}
