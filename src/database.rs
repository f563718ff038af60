//! Database handles: named sorted trees inside an environment.
//!
//! A [`Database`] is opened by a schema transaction and, once that
//! transaction commits, published into the environment's registry where any
//! later transaction can use it. [`MultiDatabase`] and
//! [`FixedMultiDatabase`] refine the same handle for trees that keep sorted
//! duplicate values per key, and fixed-size duplicates, respectively.

use crate::{
    codec::{decode_val, slice_to_val, TableObject},
    cursor::{Cursor, CursorState, FixedMultiCursor, MultiCursor},
    environment::{EnvironmentInner, Stat},
    error::{lmdb_result, Error, Result},
    flags::{DatabaseFlags, WriteFlags},
    transaction::{Transaction, TransactionKind, RW},
    Comparator,
};
use libc::c_int;
use std::{
    cmp::Ordering as CmpOrdering,
    fmt, ptr, slice,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Weak,
    },
};

/// The registry key for a database name. Lookup is case-insensitive; the
/// unnamed default database keys as the empty string.
pub(crate) fn registry_key(name: Option<&str>) -> String {
    name.unwrap_or_default().to_lowercase()
}

/// Options for opening a database through a schema transaction.
///
/// Comparators are type parameters rather than closures because the engine
/// calls them without any context pointer; see [`Comparator`].
#[derive(Clone, Copy, Default)]
pub struct DatabaseConfig {
    pub(crate) flags: DatabaseFlags,
    pub(crate) key_cmp: Option<crate::compare::CompareFn>,
    pub(crate) dup_cmp: Option<crate::compare::CompareFn>,
}

impl DatabaseConfig {
    /// Default configuration: plain keys, engine byte ordering.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the creation flags. `CREATE` is implied when opening through a
    /// schema transaction; `DUP_SORT` / `DUP_FIXED` are implied by
    /// [`open_multi_database`](crate::SchemaTransaction::open_multi_database)
    /// and
    /// [`open_fixed_multi_database`](crate::SchemaTransaction::open_fixed_multi_database).
    pub fn flags(mut self, flags: DatabaseFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Installs `C` as the key ordering for this database.
    pub fn key_comparator<C: Comparator>(mut self) -> Self {
        self.key_cmp = Some(crate::compare::bridge::<C>());
        self
    }

    /// Installs `C` as the duplicate-value ordering. Only meaningful for
    /// `DUP_SORT` databases.
    pub fn dup_comparator<C: Comparator>(mut self) -> Self {
        self.dup_cmp = Some(crate::compare::bridge::<C>());
        self
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("flags", &self.flags)
            .field("key_cmp", &self.key_cmp.is_some())
            .field("dup_cmp", &self.dup_cmp.is_some())
            .finish()
    }
}

/// A handle to a single sorted tree.
///
/// Cheap to clone; all clones share the underlying native slot and are
/// invalidated together. Handles outlive the transaction that opened them:
/// the native slot stays valid until the database is
/// [`close`](Self::close)d, [`drop_database`](Self::drop_database)d or the
/// environment shuts down.
pub struct Database {
    inner: Arc<DatabaseInner>,
}

pub(crate) struct DatabaseInner {
    /// Native slot number; [`INVALID_DBI`] once the handle is dead. Slot 0
    /// is the engine's internal free-list and is never handed to callers.
    dbi: AtomicU32,
    name: Option<String>,
    flags: DatabaseFlags,
    env: Weak<EnvironmentInner>,
}

const INVALID_DBI: ffi::MDB_dbi = 0;

impl Database {
    pub(crate) fn new(
        dbi: ffi::MDB_dbi,
        name: Option<String>,
        flags: DatabaseFlags,
        env: Weak<EnvironmentInner>,
    ) -> Self {
        Self { inner: Arc::new(DatabaseInner { dbi: AtomicU32::new(dbi), name, flags, env }) }
    }

    /// The database's name, or `None` for the unnamed default database.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// The flags the database was opened with.
    pub fn flags(&self) -> DatabaseFlags {
        self.inner.flags
    }

    pub(crate) fn registry_key(&self) -> String {
        registry_key(self.name())
    }

    pub(crate) fn dbi(&self) -> Result<ffi::MDB_dbi> {
        match self.inner.dbi.load(Ordering::SeqCst) {
            INVALID_DBI => Err(Error::Closed),
            dbi => Ok(dbi),
        }
    }

    /// Clears the slot so every clone of this handle starts failing with
    /// [`Error::Closed`]. Does not touch the native slot.
    pub(crate) fn invalidate(&self) {
        self.inner.dbi.store(INVALID_DBI, Ordering::SeqCst);
    }

    fn env(&self) -> Result<Arc<EnvironmentInner>> {
        self.inner.env.upgrade().ok_or(Error::Closed)
    }

    /// Looks up `key`, decoding the value if present.
    pub fn get<K: TransactionKind, T: TableObject>(
        &self,
        txn: &Transaction<K>,
        key: &[u8],
    ) -> Result<Option<T>> {
        let dbi = self.dbi()?;
        txn.state().execute(|txn_ptr| {
            let mut key_val = slice_to_val(Some(key));
            let mut data_val = slice_to_val(None);
            match unsafe { ffi::mdb_get(txn_ptr, dbi, &mut key_val, &mut data_val) } {
                ffi::MDB_SUCCESS => unsafe { decode_val(&data_val).map(Some) },
                ffi::MDB_NOTFOUND => Ok(None),
                code => Err(Error::from_err_code(code)),
            }
        })
    }

    /// Stores `data` under `key`.
    ///
    /// Returns `false` instead of erroring when `NO_OVERWRITE` or
    /// `NO_DUP_DATA` finds the pair already present, leaving the stored
    /// value unchanged.
    pub fn put(
        &self,
        txn: &Transaction<RW>,
        key: &[u8],
        data: &[u8],
        flags: WriteFlags,
    ) -> Result<bool> {
        let dbi = self.dbi()?;
        txn.state().execute(|txn_ptr| {
            let mut key_val = slice_to_val(Some(key));
            let mut data_val = slice_to_val(Some(data));
            let code = unsafe {
                ffi::mdb_put(txn_ptr, dbi, &mut key_val, &mut data_val, flags.bits())
            };
            put_outcome(code, flags)
        })
    }

    /// Reserves `size` bytes under `key` and returns the engine's buffer for
    /// the caller to fill before the transaction commits.
    pub fn reserve<'txn>(
        &self,
        txn: &'txn Transaction<RW>,
        key: &[u8],
        size: usize,
        flags: WriteFlags,
    ) -> Result<&'txn mut [u8]> {
        let dbi = self.dbi()?;
        txn.state().execute(|txn_ptr| {
            let mut key_val = slice_to_val(Some(key));
            let mut data_val = ffi::MDB_val { mv_size: size, mv_data: ptr::null_mut() };
            lmdb_result(unsafe {
                ffi::mdb_put(
                    txn_ptr,
                    dbi,
                    &mut key_val,
                    &mut data_val,
                    (flags | WriteFlags::RESERVE).bits(),
                )
            })?;
            // The buffer lives in the write transaction's dirty pages, so
            // tying it to `txn`'s borrow keeps it from outliving them.
            Ok(unsafe { slice::from_raw_parts_mut(data_val.mv_data as *mut u8, size) })
        })
    }

    /// Deletes `key` (with `data`, only that duplicate). Returns `false`
    /// when nothing matched.
    pub fn del(&self, txn: &Transaction<RW>, key: &[u8], data: Option<&[u8]>) -> Result<bool> {
        let dbi = self.dbi()?;
        txn.state().execute(|txn_ptr| {
            let mut key_val = slice_to_val(Some(key));
            let mut data_val = data.map(|data| slice_to_val(Some(data)));
            let data_ptr = data_val
                .as_mut()
                .map(|val| val as *mut ffi::MDB_val)
                .unwrap_or(ptr::null_mut());
            match unsafe { ffi::mdb_del(txn_ptr, dbi, &mut key_val, data_ptr) } {
                ffi::MDB_SUCCESS => Ok(true),
                ffi::MDB_NOTFOUND => Ok(false),
                code => Err(Error::from_err_code(code)),
            }
        })
    }

    /// Removes every entry, keeping the database itself.
    pub fn truncate(&self, txn: &Transaction<RW>) -> Result<()> {
        let dbi = self.dbi()?;
        txn.state().execute(|txn_ptr| lmdb_result(unsafe { ffi::mdb_drop(txn_ptr, dbi, 0) }))
    }

    /// Deletes the database from the environment and invalidates this handle
    /// and all of its clones.
    pub fn drop_database(&self, txn: &Transaction<RW>) -> Result<()> {
        let dbi = self.dbi()?;
        txn.state().execute(|txn_ptr| lmdb_result(unsafe { ffi::mdb_drop(txn_ptr, dbi, 1) }))?;
        if let Ok(env) = self.env() {
            env.remove_database(&self.registry_key());
        }
        self.invalidate();
        Ok(())
    }

    /// Closes the handle's native slot and removes it from the registry.
    ///
    /// Idempotent. The data stays on disk; the name can be reopened by a
    /// later schema transaction. Must not race transactions still using the
    /// handle.
    pub fn close(&self) {
        let dbi = self.inner.dbi.swap(INVALID_DBI, Ordering::SeqCst);
        if dbi == INVALID_DBI {
            return;
        }
        if let Some(env) = self.inner.env.upgrade() {
            env.remove_database(&self.registry_key());
            if let Ok(env_ptr) = env.env_ptr() {
                unsafe { ffi::mdb_dbi_close(env_ptr, dbi) };
            }
        }
    }

    /// Statistics for this database's tree, as seen by `txn`'s snapshot.
    pub fn stat<K: TransactionKind>(&self, txn: &Transaction<K>) -> Result<Stat> {
        let dbi = self.dbi()?;
        txn.state().execute(|txn_ptr| {
            let mut stat = Stat::new();
            lmdb_result(unsafe { ffi::mdb_stat(txn_ptr, dbi, stat.mdb_stat()) })?;
            Ok(stat)
        })
    }

    /// Compares two keys using this database's key ordering, including any
    /// installed [`Comparator`].
    pub fn compare<K: TransactionKind>(
        &self,
        txn: &Transaction<K>,
        a: &[u8],
        b: &[u8],
    ) -> Result<CmpOrdering> {
        let dbi = self.dbi()?;
        txn.state().execute(|txn_ptr| {
            let a_val = slice_to_val(Some(a));
            let b_val = slice_to_val(Some(b));
            Ok(unsafe { ffi::mdb_cmp(txn_ptr, dbi, &a_val, &b_val) }.cmp(&0))
        })
    }

    /// Opens a cursor over this database within `txn`.
    pub fn cursor<K: TransactionKind>(&self, txn: &Transaction<K>) -> Result<Cursor<K>> {
        Cursor::new(txn, self)
    }

    /// Refines the handle for duplicate-value operations.
    ///
    /// Fails with [`Error::Incompatible`] unless the database was opened
    /// with `DUP_SORT`.
    pub fn as_multi(&self) -> Result<MultiDatabase> {
        if !self.inner.flags.contains(DatabaseFlags::DUP_SORT) {
            return Err(Error::Incompatible);
        }
        Ok(MultiDatabase { db: self.clone() })
    }

    /// Refines the handle for fixed-size duplicate operations.
    ///
    /// `record_size` is the caller-declared size every value in this
    /// database has; the bulk verbs slice pages by it. Fails with
    /// [`Error::Incompatible`] unless the database was opened with
    /// `DUP_FIXED`.
    pub fn as_fixed_multi(&self, record_size: usize) -> Result<FixedMultiDatabase> {
        if !self.inner.flags.contains(DatabaseFlags::DUP_FIXED) || record_size == 0 {
            return Err(Error::Incompatible);
        }
        Ok(FixedMultiDatabase { db: MultiDatabase { db: self.clone() }, record_size })
    }

    pub(crate) fn new_cursor_state<K: TransactionKind>(
        &self,
        txn: &Transaction<K>,
    ) -> Result<Arc<CursorState>> {
        let dbi = self.dbi()?;
        CursorState::open(txn.state(), dbi)
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name())
            .field("flags", &self.flags())
            .field("open", &self.dbi().is_ok())
            .finish()
    }
}

/// A `DUP_SORT` database: each key holds a sorted set of values.
#[derive(Clone, Debug)]
pub struct MultiDatabase {
    db: Database,
}

impl MultiDatabase {
    /// Compares two values using this database's duplicate ordering.
    pub fn dup_compare<K: TransactionKind>(
        &self,
        txn: &Transaction<K>,
        a: &[u8],
        b: &[u8],
    ) -> Result<CmpOrdering> {
        let dbi = self.db.dbi()?;
        txn.state().execute(|txn_ptr| {
            let a_val = slice_to_val(Some(a));
            let b_val = slice_to_val(Some(b));
            Ok(unsafe { ffi::mdb_dcmp(txn_ptr, dbi, &a_val, &b_val) }.cmp(&0))
        })
    }

    /// Opens a duplicate-aware cursor over this database within `txn`.
    pub fn cursor<K: TransactionKind>(&self, txn: &Transaction<K>) -> Result<MultiCursor<K>> {
        MultiCursor::new(txn, &self.db)
    }
}

impl std::ops::Deref for MultiDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// A `DUP_FIXED` database: sorted duplicates where every value has the same
/// size, enabling the page-at-a-time bulk verbs.
#[derive(Clone, Debug)]
pub struct FixedMultiDatabase {
    db: MultiDatabase,
    record_size: usize,
}

impl FixedMultiDatabase {
    /// The declared size of every value, in bytes.
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Opens a bulk-capable cursor over this database within `txn`.
    pub fn cursor<K: TransactionKind>(
        &self,
        txn: &Transaction<K>,
    ) -> Result<FixedMultiCursor<K>> {
        FixedMultiCursor::new(txn, &self.db, self.record_size)
    }
}

impl std::ops::Deref for FixedMultiDatabase {
    type Target = MultiDatabase;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Maps a put status code to its outcome: `KEYEXIST` under the conditional
/// write flags reports "left unchanged" rather than an error.
pub(crate) fn put_outcome(code: c_int, flags: WriteFlags) -> Result<bool> {
    match code {
        ffi::MDB_SUCCESS => Ok(true),
        ffi::MDB_KEYEXIST
            if flags.intersects(WriteFlags::NO_OVERWRITE | WriteFlags::NO_DUP_DATA) =>
        {
            Ok(false)
        }
        code => Err(Error::from_err_code(code)),
    }
}
