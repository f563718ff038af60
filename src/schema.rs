//! The schema transaction: the only path that opens (and thereby creates)
//! databases.
//!
//! At most one schema transaction is live per environment. Databases it
//! opens stay provisional, visible only through the handles it returned,
//! until the transaction commits; commit publishes them into the
//! environment's registry, abort invalidates them.

use crate::{
    database::{registry_key, Database, DatabaseConfig, FixedMultiDatabase, MultiDatabase},
    environment::Environment,
    error::{lmdb_result, Error, Result},
    flags::DatabaseFlags,
    transaction::{Transaction, RW},
};
use parking_lot::Mutex;
use std::{
    ffi::CString,
    fmt, mem, ptr,
    sync::atomic::{AtomicBool, Ordering},
};

/// A read-write transaction that may also open databases.
///
/// Dereferences to [`Transaction<RW>`], so data operations work on it
/// directly; this is how a database is created and seeded atomically.
pub struct SchemaTransaction {
    txn: Transaction<RW>,
    provisional: Mutex<Vec<Database>>,
    /// Set once commit or abort ran, so `Drop` knows the slot and the
    /// provisional handles were already dealt with.
    settled: AtomicBool,
}

impl SchemaTransaction {
    pub(crate) fn begin(env: Environment) -> Result<Self> {
        env.inner().acquire_schema_slot()?;
        match Transaction::begin(env.clone(), ptr::null_mut()) {
            Ok(txn) => Ok(Self {
                txn,
                provisional: Mutex::new(Vec::new()),
                settled: AtomicBool::new(false),
            }),
            Err(err) => {
                env.inner().release_schema_slot();
                Err(err)
            }
        }
    }

    /// Opens `name`, creating it if absent.
    ///
    /// Names are compared case-insensitively; a name that is already
    /// committed, or already opened by this same transaction, fails with
    /// [`Error::DuplicateName`]. `None` opens the unnamed default database.
    pub fn open_database(
        &self,
        name: Option<&str>,
        config: &DatabaseConfig,
    ) -> Result<Database> {
        self.open_inner(name, config, DatabaseFlags::empty())
    }

    /// Opens `name` as a duplicate-value database; `DUP_SORT` is implied.
    pub fn open_multi_database(
        &self,
        name: Option<&str>,
        config: &DatabaseConfig,
    ) -> Result<MultiDatabase> {
        self.open_inner(name, config, DatabaseFlags::DUP_SORT)?.as_multi()
    }

    /// Opens `name` as a fixed-record database; `DUP_SORT | DUP_FIXED` is
    /// implied. `record_size` is the size every stored value must have.
    pub fn open_fixed_multi_database(
        &self,
        name: Option<&str>,
        config: &DatabaseConfig,
        record_size: usize,
    ) -> Result<FixedMultiDatabase> {
        self.open_inner(name, config, DatabaseFlags::DUP_SORT | DatabaseFlags::DUP_FIXED)?
            .as_fixed_multi(record_size)
    }

    fn open_inner(
        &self,
        name: Option<&str>,
        config: &DatabaseConfig,
        implied: DatabaseFlags,
    ) -> Result<Database> {
        let env = self.txn.env();
        let key = registry_key(name);
        let mut provisional = self.provisional.lock();
        if env.inner().has_database(&key)
            || provisional.iter().any(|db| db.registry_key() == key)
        {
            return Err(Error::DuplicateName(name.unwrap_or("<default>").to_owned()));
        }

        let c_name = name
            .map(|name| CString::new(name).map_err(|_| Error::InvalidName))
            .transpose()?;
        let flags = config.flags | implied | DatabaseFlags::CREATE;

        let dbi = self.txn.state().execute(|txn_ptr| {
            let mut dbi: ffi::MDB_dbi = 0;
            let name_ptr = c_name.as_ref().map(|name| name.as_ptr()).unwrap_or(ptr::null());
            lmdb_result(unsafe { ffi::mdb_dbi_open(txn_ptr, name_ptr, flags.bits(), &mut dbi) })?;
            // A failed comparator install propagates; the abort that follows
            // releases any slot this transaction created.
            if let Some(cmp) = config.key_cmp {
                lmdb_result(unsafe { ffi::mdb_set_compare(txn_ptr, dbi, Some(cmp)) })?;
            }
            if let Some(cmp) = config.dup_cmp {
                lmdb_result(unsafe { ffi::mdb_set_dupsort(txn_ptr, dbi, Some(cmp)) })?;
            }
            Ok(dbi)
        })?;

        // The stored flags describe the tree, not the open call.
        let db = Database::new(
            dbi,
            name.map(ToOwned::to_owned),
            flags - DatabaseFlags::CREATE,
            env.downgrade(),
        );
        provisional.push(db.clone());
        tracing::debug!(
            target: "lmdb_ward",
            name = name.unwrap_or("<default>"),
            ?flags,
            "database opened provisionally"
        );
        Ok(db)
    }

    /// Commits: data changes become durable and every database opened here
    /// is published to the environment.
    ///
    /// On a failed commit the transaction is still consumed and the opened
    /// handles are invalidated.
    pub fn commit(self) -> Result<()> {
        self.settled.store(true, Ordering::SeqCst);
        let provisional = mem::take(&mut *self.provisional.lock());
        let result = self.txn.state().finish(true);
        match result {
            Ok(()) => {
                for db in provisional {
                    self.txn.env().inner().publish_database(db);
                }
            }
            Err(_) => {
                for db in &provisional {
                    db.invalidate();
                }
            }
        }
        self.txn.env().inner().release_schema_slot();
        result
    }

    /// Aborts: data changes are discarded and every database opened here is
    /// invalidated without being published. Equivalent to dropping.
    pub fn abort(self) {}
}

impl Drop for SchemaTransaction {
    fn drop(&mut self) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.txn.state().force_abort();
        for db in self.provisional.lock().drain(..) {
            db.invalidate();
        }
        self.txn.env().inner().release_schema_slot();
    }
}

impl std::ops::Deref for SchemaTransaction {
    type Target = Transaction<RW>;

    fn deref(&self) -> &Self::Target {
        &self.txn
    }
}

impl fmt::Debug for SchemaTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaTransaction")
            .field("provisional", &self.provisional.lock().len())
            .field("settled", &self.settled.load(Ordering::SeqCst))
            .finish()
    }
}
