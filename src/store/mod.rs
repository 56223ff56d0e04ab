//! The persistent inode store.
//!
//! A transactional mapping from inode number to inode record, plus a
//! directory-entry index from `(parent, name)` to child inode, backed by an
//! embedded SQLite database. Inode numbers are allocated monotonically and
//! never reused; once a `(parent, name)` binding exists it keeps its inode
//! across process restarts, surviving even periods when the backend cannot
//! be reached.
//!
//! Transactions are lexical scopes. [`RoTxn`] reads; [`RwTxn`] additionally
//! writes and commits atomically on [`RwTxn::commit`], rolling back when
//! dropped without one. The writer is exclusive, readers are not: each
//! [`RoTxn`] runs on its own read-only connection against the WAL store and
//! holds a snapshot for its scope, so readers run alongside each other and
//! alongside the writer without ever observing a partial write.

pub mod record;

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt as _, OsStringExt as _};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension as _};
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::ROOT_INO;

pub use record::{
    raw_to_systime, systime_to_raw, validate_name, InodeAttrs, InodeFlags, InodeKind, InodeRecord,
    MAX_NAME_LEN,
};

const SCHEMA_VERSION: i64 = 1;

/// Upper bound on dentry-chain length when reconstructing a path. A longer
/// chain means the dentry index contains a cycle.
const MAX_PATH_DEPTH: usize = 1024;

/// Idle read connections kept around for reuse; anything beyond this is
/// closed when its transaction ends.
const MAX_IDLE_READERS: usize = 8;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CREATE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS inodes (
    ino         INTEGER PRIMARY KEY,
    kind        INTEGER NOT NULL,
    mode        INTEGER NOT NULL,
    uid         INTEGER NOT NULL,
    gid         INTEGER NOT NULL,
    size        INTEGER NOT NULL,
    atime_sec   INTEGER NOT NULL,
    atime_nsec  INTEGER NOT NULL,
    mtime_sec   INTEGER NOT NULL,
    mtime_nsec  INTEGER NOT NULL,
    ctime_sec   INTEGER NOT NULL,
    ctime_nsec  INTEGER NOT NULL,
    flags       INTEGER NOT NULL,
    link_target BLOB
);

CREATE TABLE IF NOT EXISTS dentries (
    parent_ino INTEGER NOT NULL,
    name       BLOB    NOT NULL,
    child_ino  INTEGER NOT NULL,
    PRIMARY KEY (parent_ino, name)
);

CREATE INDEX IF NOT EXISTS dentries_by_child ON dentries (child_ino);
"#;

/// One row yielded by directory iteration. The entry's resume offset is the
/// child inode number: entries are yielded in ascending inode order, and
/// children are always allocated after their parent, so the inode doubles
/// as a stable per-directory cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryRow {
    pub name: OsString,
    pub ino: u64,
    pub kind: InodeKind,
}

/// The persistent store. One per cache directory, owned by the cache.
pub struct InodeStore {
    path: PathBuf,
    writer: Mutex<Connection>,
    /// Idle read-only connections, grown on demand. WAL mode lets any
    /// number of them run alongside the single writer.
    readers: Mutex<Vec<Connection>>,
}

impl InodeStore {
    /// Open or create a store at `path`. Creates the root inode on first
    /// use; validates structure otherwise and fails with
    /// [`StoreError::Corrupt`] if the contents cannot be trusted.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode returns a row, so it cannot go through execute_batch.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(CREATE_SCHEMA)?;
        let version: Option<i64> = tx
            .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| row.get(0))
            .optional()?;
        match version {
            None => Self::seed(&tx)?,
            Some(SCHEMA_VERSION) => Self::validate(&tx)?,
            Some(other) => {
                return Err(StoreError::Corrupt(format!(
                    "unsupported schema version {other}"
                )))
            }
        }
        tx.commit()?;

        Ok(Self {
            path: path.to_owned(),
            writer: Mutex::new(conn),
            readers: Mutex::new(Vec::new()),
        })
    }

    /// First-use initialization: schema meta and the root directory inode.
    fn seed(conn: &Connection) -> Result<(), StoreError> {
        debug!("initializing fresh inode store");
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION],
        )?;
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('next_ino', ?1)",
            params![ROOT_INO + 1],
        )?;

        let now = systime_to_raw(SystemTime::now());
        let mode = libc::S_IFDIR | 0o755;
        conn.execute(
            "INSERT INTO inodes
                 (ino, kind, mode, uid, gid, size,
                  atime_sec, atime_nsec, mtime_sec, mtime_nsec, ctime_sec, ctime_nsec,
                  flags, link_target)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?6, ?7, ?6, ?7, 0, NULL)",
            params![
                ROOT_INO,
                InodeKind::Directory.as_u8(),
                mode,
                nix::unistd::Uid::current().as_raw(),
                nix::unistd::Gid::current().as_raw(),
                now.0,
                now.1,
            ],
        )?;
        Ok(())
    }

    /// Structural checks on an existing store.
    fn validate(conn: &Connection) -> Result<(), StoreError> {
        let root_kind: Option<u8> = conn
            .query_row("SELECT kind FROM inodes WHERE ino = ?1", params![ROOT_INO], |row| {
                row.get(0)
            })
            .optional()?;
        match root_kind.and_then(InodeKind::from_u8) {
            Some(InodeKind::Directory) => {}
            Some(_) => return Err(StoreError::Corrupt("root inode is not a directory".into())),
            None => return Err(StoreError::Corrupt("root inode missing".into())),
        }

        let next_ino: Option<i64> = conn
            .query_row("SELECT value FROM meta WHERE key = 'next_ino'", [], |row| row.get(0))
            .optional()?;
        let Some(next_ino) = next_ino else {
            return Err(StoreError::Corrupt("inode allocator missing".into()));
        };
        let max_ino: i64 =
            conn.query_row("SELECT COALESCE(MAX(ino), 0) FROM inodes", [], |row| row.get(0))?;
        if next_ino <= max_ino {
            return Err(StoreError::Corrupt(format!(
                "inode allocator at {next_ino} but inode {max_ino} already exists"
            )));
        }
        Ok(())
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A read connection from the idle pool, or a freshly opened one.
    fn reader(&self) -> Result<Connection, StoreError> {
        let pooled = {
            let mut pool = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
            pool.pop()
        };
        if let Some(conn) = pooled {
            return Ok(conn);
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Begin a read-only transaction. Readers are concurrent: each runs on
    /// its own connection and snapshots the store for its scope.
    pub fn begin_ro(&self) -> Result<RoTxn<'_>, StoreError> {
        let conn = self.reader()?;
        conn.execute_batch("BEGIN")?;
        Ok(RoTxn {
            store: self,
            conn: Some(conn),
        })
    }

    /// Begin a read-write transaction. Exclusive; commits on
    /// [`RwTxn::commit`], rolls back on drop.
    pub fn begin_rw(&self) -> Result<RwTxn<'_>, StoreError> {
        let conn = self.writer();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(RwTxn {
            conn,
            finished: false,
        })
    }
}

/// A read-only transaction scope.
pub struct RoTxn<'s> {
    store: &'s InodeStore,
    /// Taken only on drop, when the connection goes back to the pool.
    conn: Option<Connection>,
}

impl Drop for RoTxn<'_> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if conn.execute_batch("COMMIT").is_err() {
            // Connection state is unknown; let it close instead of pooling.
            return;
        }
        let mut pool = self
            .store
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if pool.len() < MAX_IDLE_READERS {
            pool.push(conn);
        }
    }
}

impl RoTxn<'_> {
    fn conn(&self) -> &Connection {
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("read connection is only taken on drop"))
    }

    pub fn getattr(&self, ino: u64) -> Result<InodeRecord, StoreError> {
        q_getattr(self.conn(), ino)
    }

    pub fn lookup(&self, parent: u64, name: &OsStr) -> Result<u64, StoreError> {
        q_lookup(self.conn(), parent, name)
    }

    /// Entries of `parent` with inode strictly greater than `after`, in
    /// ascending inode order, at most `limit` of them.
    pub fn readdir(&self, parent: u64, after: u64, limit: usize) -> Result<Vec<DirEntryRow>, StoreError> {
        q_readdir(self.conn(), parent, after, limit)
    }

    pub fn test_flag(&self, ino: u64, flag: InodeFlags) -> Result<bool, StoreError> {
        q_test_flag(self.conn(), ino, flag)
    }

    pub fn readlink(&self, ino: u64) -> Result<OsString, StoreError> {
        q_readlink(self.conn(), ino)
    }

    /// The `(parent, name)` binding under which `ino` is reachable.
    pub fn entry_of(&self, ino: u64) -> Result<(u64, OsString), StoreError> {
        q_entry_of(self.conn(), ino)
    }

    /// Absolute backend path of `ino`, reconstructed by walking the dentry
    /// index root-ward.
    pub fn path_of(&self, ino: u64) -> Result<PathBuf, StoreError> {
        q_path_of(self.conn(), ino)
    }
}

/// A read-write transaction scope.
pub struct RwTxn<'s> {
    conn: MutexGuard<'s, Connection>,
    finished: bool,
}

impl Drop for RwTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

impl RwTxn<'_> {
    /// Make every write of this scope visible atomically.
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    /// Explicitly discard every write of this scope. Dropping the
    /// transaction does the same; this form surfaces rollback errors.
    pub fn abort(mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("ROLLBACK")?;
        self.finished = true;
        Ok(())
    }

    pub fn getattr(&self, ino: u64) -> Result<InodeRecord, StoreError> {
        q_getattr(&self.conn, ino)
    }

    pub fn lookup(&self, parent: u64, name: &OsStr) -> Result<u64, StoreError> {
        q_lookup(&self.conn, parent, name)
    }

    pub fn readdir(&self, parent: u64, after: u64, limit: usize) -> Result<Vec<DirEntryRow>, StoreError> {
        q_readdir(&self.conn, parent, after, limit)
    }

    pub fn test_flag(&self, ino: u64, flag: InodeFlags) -> Result<bool, StoreError> {
        q_test_flag(&self.conn, ino, flag)
    }

    pub fn readlink(&self, ino: u64) -> Result<OsString, StoreError> {
        q_readlink(&self.conn, ino)
    }

    pub fn entry_of(&self, ino: u64) -> Result<(u64, OsString), StoreError> {
        q_entry_of(&self.conn, ino)
    }

    pub fn path_of(&self, ino: u64) -> Result<PathBuf, StoreError> {
        q_path_of(&self.conn, ino)
    }

    /// Bind `name` under `parent` to an inode carrying `attrs`, allocating
    /// one if needed.
    ///
    /// Idempotent on `(parent, name, kind)`: an existing binding of the
    /// same kind keeps its inode and has its attributes refreshed. A kind
    /// change discards the old binding (recursively unbinding any
    /// descendants), destroys the old inode, and allocates a fresh number;
    /// inode numbers are never reused.
    pub fn emplace(&self, parent: u64, name: &OsStr, attrs: &InodeAttrs) -> Result<u64, StoreError> {
        validate_name(name)?;
        let parent_rec = q_getattr(&self.conn, parent)?;
        if parent_rec.kind != InodeKind::Directory {
            return Err(StoreError::NotADirectory);
        }

        match q_lookup(&self.conn, parent, name) {
            Ok(existing) => {
                let rec = q_getattr(&self.conn, existing)?;
                if rec.kind == attrs.kind {
                    self.write_attrs(existing, attrs)?;
                    return Ok(existing);
                }
                debug!(
                    parent,
                    name = ?name,
                    old_ino = existing,
                    old_kind = ?rec.kind,
                    new_kind = ?attrs.kind,
                    "kind change, re-allocating inode"
                );
                remove_subtree(&self.conn, existing)?;
                self.conn.execute(
                    "DELETE FROM dentries WHERE parent_ino = ?1 AND name = ?2",
                    params![parent, name.as_bytes()],
                )?;
                self.conn
                    .execute("DELETE FROM inodes WHERE ino = ?1", params![existing])?;
            }
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let ino = self.allocate_ino()?;
        let (asec, ansec) = systime_to_raw(attrs.atime);
        let (msec, mnsec) = systime_to_raw(attrs.mtime);
        let (csec, cnsec) = systime_to_raw(attrs.ctime);
        self.conn.execute(
            "INSERT INTO inodes
                 (ino, kind, mode, uid, gid, size,
                  atime_sec, atime_nsec, mtime_sec, mtime_nsec, ctime_sec, ctime_nsec,
                  flags, link_target)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, ?13)",
            params![
                ino,
                attrs.kind.as_u8(),
                attrs.kind.ifmt() | (attrs.perm & 0o7777),
                attrs.uid,
                attrs.gid,
                attrs.size,
                asec,
                ansec,
                msec,
                mnsec,
                csec,
                cnsec,
                attrs.link_target.as_deref().map(OsStr::as_bytes),
            ],
        )?;
        self.conn.execute(
            "INSERT INTO dentries (parent_ino, name, child_ino) VALUES (?1, ?2, ?3)",
            params![parent, name.as_bytes(), ino],
        )?;
        trace!(parent, name = ?name, ino, "bound new inode");
        Ok(ino)
    }

    /// Refresh the attributes of an existing inode in place. The kind must
    /// match; a change is reported as [`StoreError::KindMismatch`] so the
    /// caller can go through [`RwTxn::emplace`] instead.
    pub fn set_attr(&self, ino: u64, attrs: &InodeAttrs) -> Result<(), StoreError> {
        let rec = q_getattr(&self.conn, ino)?;
        if rec.kind != attrs.kind {
            return Err(StoreError::KindMismatch);
        }
        self.write_attrs(ino, attrs)
    }

    pub fn set_flag(&self, ino: u64, flag: InodeFlags, value: bool) -> Result<(), StoreError> {
        let raw: Option<u32> = self
            .conn
            .query_row("SELECT flags FROM inodes WHERE ino = ?1", params![ino], |row| row.get(0))
            .optional()?;
        let Some(raw) = raw else {
            return Err(StoreError::NotFound);
        };
        // from_bits_retain keeps bits this build does not know about.
        let mut flags = InodeFlags::from_bits_retain(raw);
        flags.set(flag, value);
        self.conn.execute(
            "UPDATE inodes SET flags = ?1 WHERE ino = ?2",
            params![flags.bits(), ino],
        )?;
        Ok(())
    }

    /// Drop the `(parent, name)` binding. The child's inode record stays:
    /// the kernel may still hold the number, and numbers are never reused
    /// anyway. A directory child's descendants are unbound recursively.
    pub fn remove_entry(&self, parent: u64, name: &OsStr) -> Result<(), StoreError> {
        let child = q_lookup(&self.conn, parent, name)?;
        let rec = q_getattr(&self.conn, child)?;
        if rec.kind == InodeKind::Directory {
            remove_subtree(&self.conn, child)?;
        }
        self.conn.execute(
            "DELETE FROM dentries WHERE parent_ino = ?1 AND name = ?2",
            params![parent, name.as_bytes()],
        )?;
        trace!(parent, name = ?name, child, "unbound entry");
        Ok(())
    }

    /// Reconciliation step of a complete backend listing: keep exactly the
    /// bindings whose names were observed, unbind the rest.
    pub fn retain_entries(&self, parent: u64, observed: &HashSet<OsString>) -> Result<(), StoreError> {
        let current = q_readdir(&self.conn, parent, 0, usize::MAX)?;
        for row in current {
            if !observed.contains(&row.name) {
                debug!(parent, name = ?row.name, ino = row.ino, "entry gone from backend, unbinding");
                self.remove_entry(parent, &row.name)?;
            }
        }
        Ok(())
    }

    fn allocate_ino(&self) -> Result<u64, StoreError> {
        let next: u64 = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'next_ino'", [], |row| row.get(0))?;
        self.conn
            .execute("UPDATE meta SET value = value + 1 WHERE key = 'next_ino'", [])?;
        Ok(next)
    }

    /// Attribute update shared by `emplace` and `set_attr`. Flags are left
    /// alone; a cached link target is only replaced, never erased.
    fn write_attrs(&self, ino: u64, attrs: &InodeAttrs) -> Result<(), StoreError> {
        let (asec, ansec) = systime_to_raw(attrs.atime);
        let (msec, mnsec) = systime_to_raw(attrs.mtime);
        let (csec, cnsec) = systime_to_raw(attrs.ctime);
        self.conn.execute(
            "UPDATE inodes SET
                 mode = ?1, uid = ?2, gid = ?3, size = ?4,
                 atime_sec = ?5, atime_nsec = ?6,
                 mtime_sec = ?7, mtime_nsec = ?8,
                 ctime_sec = ?9, ctime_nsec = ?10,
                 link_target = COALESCE(?11, link_target)
             WHERE ino = ?12",
            params![
                attrs.kind.ifmt() | (attrs.perm & 0o7777),
                attrs.uid,
                attrs.gid,
                attrs.size,
                asec,
                ansec,
                msec,
                mnsec,
                csec,
                cnsec,
                attrs.link_target.as_deref().map(OsStr::as_bytes),
                ino,
            ],
        )?;
        Ok(())
    }
}

fn q_getattr(conn: &Connection, ino: u64) -> Result<InodeRecord, StoreError> {
    let rec = conn
        .query_row(
            "SELECT kind, mode, uid, gid, size,
                    atime_sec, atime_nsec, mtime_sec, mtime_nsec, ctime_sec, ctime_nsec,
                    flags, link_target
             FROM inodes WHERE ino = ?1",
            params![ino],
            |row| {
                Ok((
                    row.get::<_, u8>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, u64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, u32>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, u32>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, u32>(10)?,
                    row.get::<_, u32>(11)?,
                    row.get::<_, Option<Vec<u8>>>(12)?,
                ))
            },
        )
        .optional()?;
    let Some((kind, mode, uid, gid, size, asec, ansec, msec, mnsec, csec, cnsec, flags, target)) =
        rec
    else {
        return Err(StoreError::NotFound);
    };
    let kind = InodeKind::from_u8(kind)
        .ok_or_else(|| StoreError::Corrupt(format!("inode {ino} has unknown kind {kind}")))?;
    Ok(InodeRecord {
        ino,
        kind,
        mode,
        uid,
        gid,
        size,
        atime: raw_to_systime(asec, ansec),
        mtime: raw_to_systime(msec, mnsec),
        ctime: raw_to_systime(csec, cnsec),
        flags: InodeFlags::from_bits_retain(flags),
        link_target: target.map(OsString::from_vec),
    })
}

fn q_lookup(conn: &Connection, parent: u64, name: &OsStr) -> Result<u64, StoreError> {
    conn.query_row(
        "SELECT child_ino FROM dentries WHERE parent_ino = ?1 AND name = ?2",
        params![parent, name.as_bytes()],
        |row| row.get(0),
    )
    .optional()?
    .ok_or(StoreError::NotFound)
}

fn q_readdir(
    conn: &Connection,
    parent: u64,
    after: u64,
    limit: usize,
) -> Result<Vec<DirEntryRow>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT d.name, d.child_ino, i.kind
         FROM dentries d JOIN inodes i ON i.ino = d.child_ino
         WHERE d.parent_ino = ?1 AND d.child_ino > ?2
         ORDER BY d.child_ino ASC
         LIMIT ?3",
    )?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map(params![parent, after, limit], |row| {
        Ok((
            row.get::<_, Vec<u8>>(0)?,
            row.get::<_, u64>(1)?,
            row.get::<_, u8>(2)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (name, ino, kind) = row?;
        let kind = InodeKind::from_u8(kind)
            .ok_or_else(|| StoreError::Corrupt(format!("inode {ino} has unknown kind {kind}")))?;
        out.push(DirEntryRow {
            name: OsString::from_vec(name),
            ino,
            kind,
        });
    }
    Ok(out)
}

fn q_test_flag(conn: &Connection, ino: u64, flag: InodeFlags) -> Result<bool, StoreError> {
    let raw: Option<u32> = conn
        .query_row("SELECT flags FROM inodes WHERE ino = ?1", params![ino], |row| row.get(0))
        .optional()?;
    let Some(raw) = raw else {
        return Err(StoreError::NotFound);
    };
    Ok(InodeFlags::from_bits_retain(raw).contains(flag))
}

fn q_readlink(conn: &Connection, ino: u64) -> Result<OsString, StoreError> {
    let rec = q_getattr(conn, ino)?;
    if rec.kind != InodeKind::Link {
        return Err(StoreError::NotALink);
    }
    rec.link_target.ok_or(StoreError::NotFound)
}

fn q_entry_of(conn: &Connection, ino: u64) -> Result<(u64, OsString), StoreError> {
    conn.query_row(
        "SELECT parent_ino, name FROM dentries WHERE child_ino = ?1 LIMIT 1",
        params![ino],
        |row| Ok((row.get::<_, u64>(0)?, row.get::<_, Vec<u8>>(1)?)),
    )
    .optional()?
    .map(|(parent, name)| (parent, OsString::from_vec(name)))
    .ok_or(StoreError::NotFound)
}

fn q_path_of(conn: &Connection, ino: u64) -> Result<PathBuf, StoreError> {
    if ino == ROOT_INO {
        return Ok(PathBuf::from("/"));
    }
    let mut parts: Vec<OsString> = Vec::new();
    let mut cur = ino;
    while cur != ROOT_INO {
        if parts.len() > MAX_PATH_DEPTH {
            return Err(StoreError::Corrupt(format!(
                "dentry chain above inode {ino} exceeds {MAX_PATH_DEPTH} levels"
            )));
        }
        let (parent, name) = q_entry_of(conn, cur)?;
        parts.push(name);
        cur = parent;
    }
    let mut path = PathBuf::from("/");
    for part in parts.iter().rev() {
        path.push(part);
    }
    Ok(path)
}

/// Recursively unbind every entry below `ino`. Inode records of the
/// descendants stay behind; only the bindings go.
fn remove_subtree(conn: &Connection, ino: u64) -> Result<(), StoreError> {
    let mut stack = vec![ino];
    while let Some(cur) = stack.pop() {
        let children = q_readdir(conn, cur, 0, usize::MAX)?;
        conn.execute("DELETE FROM dentries WHERE parent_ino = ?1", params![cur])?;
        for child in children {
            if child.kind == InodeKind::Directory {
                stack.push(child.ino);
            }
        }
    }
    Ok(())
}
