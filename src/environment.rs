//! The root resource: owns the database registry, tracks live transactions
//! and cascades shutdown to every descendant handle.

use crate::{
    database::{registry_key, Database},
    error::{lmdb_result, Error, Result},
    flags::EnvironmentFlags,
    schema::SchemaTransaction,
    transaction::{Transaction, TxnState, RO, RW},
};
use libc::c_int;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    ffi::CString,
    fmt,
    os::unix::ffi::OsStrExt,
    path::Path,
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicPtr, Ordering},
        Arc, Weak,
    },
};

/// Default file permission bits for the data and lock files.
const DEFAULT_OPEN_MODE: u32 = 0o644;

/// Largest map a 32-bit process is allowed when the auto-shrink policy is
/// enabled.
const MAX_MAP_SIZE_32BIT: usize = i32::MAX as usize;

/// An LMDB environment: a memory-mapped file (or directory) holding one or
/// more sorted key-value databases.
///
/// The environment is the root of the handle-ownership graph. It hands out
/// [`Transaction`]s, tracks them while they are live, owns the registry of
/// committed [`Database`]s, and tears everything down top-down on
/// [`close`](Self::close) or drop.
///
/// Construction is two-phase: configure, then [`open`](Self::open).
///
/// ```no_run
/// use lmdb_ward::{DatabaseConfig, Environment, WriteFlags};
/// use std::path::Path;
///
/// fn main() -> lmdb_ward::Result<()> {
///     let env = Environment::new();
///     env.set_map_size(1024 * 1024 * 1024)?;
///     env.set_max_dbs(4)?;
///     env.open(Path::new("/tmp/my_database"))?;
///
///     let schema = env.begin_schema_txn()?;
///     let db = schema.open_database(Some("meta"), &DatabaseConfig::default())?;
///     schema.commit()?;
///
///     let txn = env.begin_rw_txn()?;
///     db.put(&txn, b"hello", b"world", WriteFlags::empty())?;
///     txn.commit()?;
///     Ok(())
/// }
/// ```
pub struct Environment {
    inner: Arc<EnvironmentInner>,
}

impl Environment {
    /// Creates a new, unopened environment.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EnvironmentInner {
                env: AtomicPtr::new(ptr::null_mut()),
                opened: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                config: Mutex::new(EnvConfig::default()),
                databases: Mutex::new(HashMap::new()),
                txns: Mutex::new(HashMap::new()),
                schema_active: AtomicBool::new(false),
            }),
        }
    }

    /// Sets the size of the memory map, in bytes.
    ///
    /// Fails with [`Error::ConfigAfterOpen`] once the environment is open.
    pub fn set_map_size(&self, size: usize) -> Result<()> {
        self.configure(|config| config.map_size = Some(size))
    }

    /// Sets the maximum number of named databases.
    pub fn set_max_dbs(&self, count: u32) -> Result<()> {
        self.configure(|config| config.max_dbs = Some(count))
    }

    /// Sets the maximum number of reader slots.
    pub fn set_max_readers(&self, count: u32) -> Result<()> {
        self.configure(|config| config.max_readers = Some(count))
    }

    /// Controls whether the configured map size is clamped to the address
    /// space a 32-bit process can actually map. Defaults to `true`.
    pub fn set_shrink_map_on_32bit(&self, shrink: bool) -> Result<()> {
        self.configure(|config| config.shrink_map_on_32bit = shrink)
    }

    fn configure(&self, apply: impl FnOnce(&mut EnvConfig)) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        // Taking the config lock before re-checking `opened` closes the race
        // against a concurrent open, which holds the same lock.
        let mut config = self.inner.config.lock();
        if self.inner.opened.load(Ordering::SeqCst) {
            return Err(Error::ConfigAfterOpen);
        }
        apply(&mut config);
        Ok(())
    }

    /// Opens the environment at `path` with default flags and file mode.
    pub fn open(&self, path: &Path) -> Result<()> {
        self.open_with(path, EnvironmentFlags::empty(), DEFAULT_OPEN_MODE)
    }

    /// Opens the environment at `path`.
    ///
    /// Unless [`EnvironmentFlags::NO_SUB_DIR`] is given, `path` must be an
    /// existing directory. Fails with [`Error::AlreadyOpen`] on a second
    /// call.
    pub fn open_with(&self, path: &Path, flags: EnvironmentFlags, mode: u32) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let config = self.inner.config.lock();
        if self.inner.opened.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyOpen);
        }
        let result = self.open_native(path, flags, mode, &config);
        if result.is_err() {
            // A failed open leaves the environment configurable and
            // re-openable.
            self.inner.opened.store(false, Ordering::SeqCst);
        }
        result
    }

    fn open_native(
        &self,
        path: &Path,
        flags: EnvironmentFlags,
        mode: u32,
        config: &EnvConfig,
    ) -> Result<()> {
        let c_path =
            CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::InvalidName)?;
        unsafe {
            let mut env: *mut ffi::MDB_env = ptr::null_mut();
            lmdb_result(ffi::mdb_env_create(&mut env))?;
            let configured = (|| {
                if let Some(size) = config.map_size {
                    lmdb_result(ffi::mdb_env_set_mapsize(env, config.effective_map_size(size)))?;
                }
                if let Some(count) = config.max_dbs {
                    lmdb_result(ffi::mdb_env_set_maxdbs(env, count))?;
                }
                if let Some(count) = config.max_readers {
                    lmdb_result(ffi::mdb_env_set_maxreaders(env, count))?;
                }
                lmdb_result(ffi::mdb_env_open(
                    env,
                    c_path.as_ptr(),
                    flags.bits(),
                    mode as ffi::mdb_mode_t,
                ))
            })();
            match configured {
                Ok(()) => {
                    self.inner.env.store(env, Ordering::SeqCst);
                    tracing::debug!(target: "lmdb_ward", path = %path.display(), "environment opened");
                    Ok(())
                }
                Err(err) => {
                    ffi::mdb_env_close(env);
                    Err(err)
                }
            }
        }
    }

    /// Returns `true` once the environment has been opened and not closed.
    pub fn is_open(&self) -> bool {
        self.inner.env_ptr().is_ok()
    }

    /// Begins a read-only transaction.
    pub fn begin_ro_txn(&self) -> Result<Transaction<RO>> {
        Transaction::begin(self.clone(), ptr::null_mut())
    }

    /// Begins a read-write transaction.
    ///
    /// Blocks until any other live writer commits or aborts; that
    /// serialization is the engine's, not the wrapper's.
    pub fn begin_rw_txn(&self) -> Result<Transaction<RW>> {
        Transaction::begin(self.clone(), ptr::null_mut())
    }

    /// Begins the schema transaction: the single transaction type allowed to
    /// open (and thereby create) databases.
    ///
    /// Fails with [`Error::SchemaTransactionActive`] while another one is
    /// live on this environment.
    pub fn begin_schema_txn(&self) -> Result<SchemaTransaction> {
        SchemaTransaction::begin(self.clone())
    }

    /// Looks up a committed database by name (case-insensitive).
    ///
    /// `None` addresses the unnamed default database.
    pub fn database(&self, name: Option<&str>) -> Result<Database> {
        self.inner
            .databases
            .lock()
            .get(&registry_key(name))
            .cloned()
            .ok_or_else(|| Error::DatabaseNotFound(name.unwrap_or("<default>").to_owned()))
    }

    /// Returns a snapshot of every committed database.
    pub fn databases(&self) -> Vec<Database> {
        self.inner.databases.lock().values().cloned().collect()
    }

    /// Flushes buffered data to disk.
    ///
    /// With `force`, the flush is synchronous even under `NO_SYNC` or
    /// `MAP_ASYNC`.
    pub fn sync(&self, force: bool) -> Result<()> {
        let env = self.inner.env_ptr()?;
        lmdb_result(unsafe { ffi::mdb_env_sync(env, force as c_int) })
    }

    /// Retrieves statistics about the environment's main tree.
    pub fn stat(&self) -> Result<Stat> {
        let env = self.inner.env_ptr()?;
        unsafe {
            let mut stat = Stat::new();
            lmdb_result(ffi::mdb_env_stat(env, stat.mdb_stat()))?;
            Ok(stat)
        }
    }

    /// Retrieves runtime information about the environment.
    pub fn info(&self) -> Result<Info> {
        let env = self.inner.env_ptr()?;
        unsafe {
            let mut info = Info::new();
            lmdb_result(ffi::mdb_env_info(env, info.mdb_info()))?;
            Ok(info)
        }
    }

    /// Closes the environment.
    ///
    /// Idempotent. Every tracked transaction is aborted (closing its cursors
    /// first), every database handle is invalidated, and any later operation
    /// on a descendant handle fails with [`Error::Closed`]. The native
    /// handle is released once the last clone of this environment and of its
    /// descendants is gone, which keeps in-flight operations from observing
    /// a freed map.
    pub fn close(&self) {
        self.inner.close_cascade();
    }

    pub(crate) fn inner(&self) -> &EnvironmentInner {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> Weak<EnvironmentInner> {
        Arc::downgrade(&self.inner)
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Environment {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("open", &self.is_open())
            .field("databases", &self.inner.databases.lock().len())
            .finish_non_exhaustive()
    }
}

/// Pre-open configuration, applied to the native handle during `open`.
#[derive(Clone, Debug)]
struct EnvConfig {
    map_size: Option<usize>,
    max_dbs: Option<u32>,
    max_readers: Option<u32>,
    shrink_map_on_32bit: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self { map_size: None, max_dbs: None, max_readers: None, shrink_map_on_32bit: true }
    }
}

impl EnvConfig {
    fn effective_map_size(&self, requested: usize) -> usize {
        if self.shrink_map_on_32bit && cfg!(target_pointer_width = "32") {
            requested.min(MAX_MAP_SIZE_32BIT)
        } else {
            requested
        }
    }
}

/// Shared state behind every [`Environment`] clone.
pub(crate) struct EnvironmentInner {
    /// Native handle; null until `open`, released in `Drop` exactly once.
    env: AtomicPtr<ffi::MDB_env>,
    opened: AtomicBool,
    closed: AtomicBool,
    config: Mutex<EnvConfig>,
    /// Committed databases, keyed by case-folded name. Provisional databases
    /// live on their schema transaction until it commits.
    databases: Mutex<HashMap<String, Database>>,
    /// Live transactions, keyed by native handle address.
    txns: Mutex<HashMap<usize, Weak<TxnState>>>,
    schema_active: AtomicBool,
}

// SAFETY: the native environment pointer is write-once (open) and
// release-once (drop); all mutable registries are mutex-guarded.
unsafe impl Send for EnvironmentInner {}
unsafe impl Sync for EnvironmentInner {}

impl EnvironmentInner {
    /// Returns the native handle, or the state error explaining why there
    /// isn't one.
    pub(crate) fn env_ptr(&self) -> Result<*mut ffi::MDB_env> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let env = self.env.load(Ordering::SeqCst);
        if env.is_null() {
            return Err(Error::NotOpen);
        }
        Ok(env)
    }

    /// Tracks a freshly begun transaction. The key is the native handle
    /// address, which is unique among live transactions; a collision means
    /// the engine handed out a handle the wrapper still considers live.
    pub(crate) fn track_txn(&self, key: usize, state: &Arc<TxnState>) -> Result<()> {
        let mut txns = self.txns.lock();
        if let Some(existing) = txns.get(&key) {
            if existing.strong_count() > 0 {
                return Err(Error::ConcurrentTransactionId);
            }
        }
        txns.insert(key, Arc::downgrade(state));
        Ok(())
    }

    pub(crate) fn untrack_txn(&self, key: usize) {
        self.txns.lock().remove(&key);
    }

    pub(crate) fn has_database(&self, key: &str) -> bool {
        self.databases.lock().contains_key(key)
    }

    /// Moves a committed schema transaction's database into the shared
    /// registry.
    pub(crate) fn publish_database(&self, db: Database) {
        tracing::debug!(target: "lmdb_ward", name = db.name().unwrap_or("<default>"), "database published");
        self.databases.lock().insert(db.registry_key(), db);
    }

    pub(crate) fn remove_database(&self, key: &str) {
        self.databases.lock().remove(key);
    }

    /// Flips the schema-transaction flag; `Err` if one is already live.
    pub(crate) fn acquire_schema_slot(&self) -> Result<()> {
        if self.schema_active.swap(true, Ordering::SeqCst) {
            return Err(Error::SchemaTransactionActive);
        }
        Ok(())
    }

    pub(crate) fn release_schema_slot(&self) {
        self.schema_active.store(false, Ordering::SeqCst);
    }

    /// Invalidates every descendant handle, exactly once.
    ///
    /// Order matters: transactions (which close their cursors) before
    /// databases, both before the native environment release in `Drop`.
    fn close_cascade(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let txns: Vec<Arc<TxnState>> =
            self.txns.lock().drain().filter_map(|(_, weak)| weak.upgrade()).collect();
        for txn in &txns {
            txn.force_abort();
        }
        let databases: Vec<Database> =
            self.databases.lock().drain().map(|(_, db)| db).collect();
        for db in &databases {
            db.invalidate();
        }
        tracing::debug!(
            target: "lmdb_ward",
            aborted_txns = txns.len(),
            cleared_dbs = databases.len(),
            "environment closed"
        );
    }
}

impl Drop for EnvironmentInner {
    fn drop(&mut self) {
        self.close_cascade();
        let env = *self.env.get_mut();
        if !env.is_null() {
            unsafe { ffi::mdb_env_close(env) };
        }
    }
}

/// Statistics about a B-tree, as reported by the engine.
#[repr(transparent)]
pub struct Stat(ffi::MDB_stat);

impl Stat {
    pub(crate) fn new() -> Self {
        unsafe { Self(std::mem::zeroed()) }
    }

    pub(crate) fn mdb_stat(&mut self) -> *mut ffi::MDB_stat {
        &mut self.0
    }

    /// Size of a database page, in bytes.
    pub fn page_size(&self) -> u32 {
        self.0.ms_psize
    }

    /// Depth (height) of the B-tree.
    pub fn depth(&self) -> u32 {
        self.0.ms_depth
    }

    /// Number of internal (non-leaf) pages.
    pub fn branch_pages(&self) -> usize {
        self.0.ms_branch_pages
    }

    /// Number of leaf pages.
    pub fn leaf_pages(&self) -> usize {
        self.0.ms_leaf_pages
    }

    /// Number of overflow pages.
    pub fn overflow_pages(&self) -> usize {
        self.0.ms_overflow_pages
    }

    /// Number of data items.
    pub fn entries(&self) -> usize {
        self.0.ms_entries
    }
}

impl fmt::Debug for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stat")
            .field("page_size", &self.page_size())
            .field("depth", &self.depth())
            .field("entries", &self.entries())
            .finish_non_exhaustive()
    }
}

/// Runtime information about an environment.
#[repr(transparent)]
pub struct Info(ffi::MDB_envinfo);

impl Info {
    pub(crate) fn new() -> Self {
        unsafe { Self(std::mem::zeroed()) }
    }

    pub(crate) fn mdb_info(&mut self) -> *mut ffi::MDB_envinfo {
        &mut self.0
    }

    /// Size of the memory map, in bytes.
    pub fn map_size(&self) -> usize {
        self.0.me_mapsize
    }

    /// Page number of the last used page.
    pub fn last_pgno(&self) -> usize {
        self.0.me_last_pgno
    }

    /// Id of the last committed transaction.
    pub fn last_txnid(&self) -> usize {
        self.0.me_last_txnid
    }

    /// Maximum number of reader slots.
    pub fn max_readers(&self) -> u32 {
        self.0.me_maxreaders
    }

    /// Number of reader slots currently in use.
    pub fn num_readers(&self) -> u32 {
        self.0.me_numreaders
    }
}

impl fmt::Debug for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Info")
            .field("map_size", &self.map_size())
            .field("last_txnid", &self.last_txnid())
            .field("num_readers", &self.num_readers())
            .finish_non_exhaustive()
    }
}
