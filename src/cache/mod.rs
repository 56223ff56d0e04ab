//! The cache façade.
//!
//! Owns the physical store under a cache directory and hands out
//! transaction scopes. One process at a time: construction takes an
//! exclusive `flock` on a lock file next to the store, so a second mount
//! over the same cache directory fails fast instead of corrupting it.

use std::ffi::OsStr;
use std::fs::File;
use std::path::Path;

use nix::fcntl::{Flock, FlockArg};
use tracing::info;

use crate::error::StoreError;
use crate::store::{InodeStore, RoTxn, RwTxn};

const STORE_FILE: &str = "metadata.db";
const LOCK_FILE: &str = "cache.lock";

pub struct Cache {
    store: InodeStore,
    /// Held for the lifetime of the cache; released by the kernel when the
    /// process exits, however it exits.
    _lock: Flock<File>,
}

impl Cache {
    /// Open or create the cache under `dir`. The root inode exists once
    /// this returns.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;

        let lock_file = File::create(dir.join(LOCK_FILE))?;
        let lock = Flock::lock(lock_file, FlockArg::LockExclusiveNonblock).map_err(
            |(_, errno)| {
                StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    format!("cache directory {} is in use by another process ({errno})", dir.display()),
                ))
            },
        )?;

        let store = InodeStore::open(&dir.join(STORE_FILE))?;
        info!(dir = %dir.display(), "cache opened");
        Ok(Self {
            store,
            _lock: lock,
        })
    }

    pub fn begin_ro(&self) -> Result<RoTxn<'_>, StoreError> {
        self.store.begin_ro()
    }

    pub fn begin_rw(&self) -> Result<RwTxn<'_>, StoreError> {
        self.store.begin_rw()
    }

    /// One-shot lookup convenience for callers that need nothing else from
    /// the transaction.
    pub fn lookup(&self, parent: u64, name: &OsStr) -> Result<u64, StoreError> {
        self.begin_ro()?.lookup(parent, name)
    }
}
