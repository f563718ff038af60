//! Transactions: typestate read-only / read-write handles over native
//! transactions, with single-winner teardown shared by commit, abort, drop
//! and the environment's close cascade.

use crate::{
    cursor::CursorState,
    environment::Environment,
    error::{lmdb_result, Error, Result},
};
use libc::c_uint;
use parking_lot::Mutex;
use std::{
    fmt,
    marker::PhantomData,
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicPtr, Ordering},
        Arc, Weak,
    },
};

mod private {
    pub trait Sealed {}

    impl Sealed for super::RO {}
    impl Sealed for super::RW {}
}

/// Marker trait for transaction access modes. Sealed: the only
/// implementations are [`RO`] and [`RW`].
pub trait TransactionKind: private::Sealed + Send + Sync + fmt::Debug + 'static {
    #[doc(hidden)]
    const OPEN_FLAGS: c_uint;

    /// Whether the mode only permits reads.
    const IS_READ_ONLY: bool;
}

/// Read-only transaction mode.
#[derive(Debug)]
#[non_exhaustive]
pub struct RO;

/// Read-write transaction mode.
#[derive(Debug)]
#[non_exhaustive]
pub struct RW;

impl TransactionKind for RO {
    const OPEN_FLAGS: c_uint = ffi::MDB_RDONLY;
    const IS_READ_ONLY: bool = true;
}

impl TransactionKind for RW {
    const OPEN_FLAGS: c_uint = 0;
    const IS_READ_ONLY: bool = false;
}

/// A transaction on an [`Environment`].
///
/// The access mode is part of the type: mutating operations are only
/// callable through a `Transaction<RW>`, so "write inside a read-only
/// transaction" is unrepresentable rather than a runtime error.
///
/// A transaction owns the cursors opened under it and closes them first
/// whenever it finishes, no matter which path finishes it: explicit
/// [`commit`](Self::commit) or [`abort`](Self::abort), going out of scope,
/// or the environment's close cascade. Exactly one of those paths performs
/// the native teardown; the others observe [`Error::Closed`]. A parent
/// finishing takes its live nested children with it: the engine commits or
/// aborts them together with the parent, and their handles flip to
/// [`Error::Closed`] without a second native call.
///
/// Transactions are confined to the thread that began them; the engine ties
/// reader-slot and writer-lock bookkeeping to that thread, so the handle
/// does not cross threads:
///
/// ```compile_fail
/// fn sendable<T: Send>() {}
/// sendable::<lmdb_ward::Transaction<lmdb_ward::RO>>();
/// ```
pub struct Transaction<K: TransactionKind> {
    state: Arc<TxnState>,
    /// Pins the handle to its thread (`*mut` is neither `Send` nor `Sync`).
    _mode: PhantomData<(K, *mut ffi::MDB_txn)>,
}

impl<K: TransactionKind> Transaction<K> {
    pub(crate) fn begin(env: Environment, parent: *mut ffi::MDB_txn) -> Result<Self> {
        let env_ptr = env.inner().env_ptr()?;
        let mut txn: *mut ffi::MDB_txn = ptr::null_mut();
        lmdb_result(unsafe { ffi::mdb_txn_begin(env_ptr, parent, K::OPEN_FLAGS, &mut txn) })?;

        let state = Arc::new(TxnState {
            txn: AtomicPtr::new(txn),
            lock: Mutex::new(()),
            done: AtomicBool::new(false),
            read_only: K::IS_READ_ONLY,
            env,
            cursors: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
        });
        if let Err(err) = state.env.inner().track_txn(txn as usize, &state) {
            // The wrapper refuses to track two live transactions behind one
            // native handle; the fresh one is torn down before it escapes.
            state.disarm();
            unsafe { ffi::mdb_txn_abort(txn) };
            return Err(err);
        }
        tracing::trace!(target: "lmdb_ward", read_only = K::IS_READ_ONLY, "transaction begun");
        Ok(Self { state, _mode: PhantomData })
    }

    /// The engine's id for this transaction: the snapshot number for
    /// readers, the (unique) sequence number for writers.
    pub fn id(&self) -> Result<usize> {
        self.state.execute(|txn| Ok(unsafe { ffi::mdb_txn_id(txn) }))
    }

    /// The environment this transaction belongs to.
    pub fn env(&self) -> &Environment {
        &self.state.env
    }

    /// Commits the transaction, closing its cursors first.
    ///
    /// A failed commit still consumes the transaction; the engine frees the
    /// native handle on both outcomes.
    pub fn commit(self) -> Result<()> {
        self.state.finish(true)
    }

    /// Aborts the transaction, closing its cursors first. Equivalent to
    /// dropping it, but explicit at the call site.
    pub fn abort(self) {
        let _ = self.state.finish(false);
    }

    pub(crate) fn state(&self) -> &Arc<TxnState> {
        &self.state
    }
}

impl Transaction<RW> {
    /// Begins a nested transaction inside this one.
    ///
    /// The child sees the parent's uncommitted writes; the parent must not
    /// be used until the child finishes. If the parent finishes first, the
    /// engine finishes the child with it and the child handle reports
    /// [`Error::Closed`] from then on.
    pub fn begin_nested(&self) -> Result<Transaction<RW>> {
        // The child is recorded under the parent lock so the parent's
        // teardown can never slip between begin and registration.
        self.state.execute(|parent| {
            let child = Transaction::begin(self.state.env.clone(), parent)?;
            self.state.children.lock().push(Arc::downgrade(child.state()));
            Ok(child)
        })
    }
}

impl Transaction<RO> {
    /// Releases this reader's snapshot while keeping the handle (and its
    /// reader slot) for [`renew`](Self::renew). Operations between reset and
    /// renew fail inside the engine.
    pub fn reset(&self) -> Result<()> {
        self.state.execute(|txn| {
            unsafe { ffi::mdb_txn_reset(txn) };
            Ok(())
        })
    }

    /// Acquires a fresh snapshot on a previously [`reset`](Self::reset)
    /// handle.
    pub fn renew(&self) -> Result<()> {
        self.state.execute(|txn| lmdb_result(unsafe { ffi::mdb_txn_renew(txn) }))
    }
}

impl<K: TransactionKind> Drop for Transaction<K> {
    fn drop(&mut self) {
        // No-op when commit/abort/close already won the teardown race.
        self.state.force_abort();
    }
}

impl<K: TransactionKind> fmt::Debug for Transaction<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("read_only", &K::IS_READ_ONLY)
            .field("done", &self.state.done.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Shared transaction state, reachable from the owning [`Transaction`], the
/// cursors opened under it and (weakly) the environment's registry.
pub(crate) struct TxnState {
    /// Native handle; nulled by whichever path finishes the transaction.
    txn: AtomicPtr<ffi::MDB_txn>,
    /// Serializes every native call on this transaction. Native transactions
    /// are not thread-safe; the wrapper's handles are.
    lock: Mutex<()>,
    done: AtomicBool,
    read_only: bool,
    env: Environment,
    cursors: Mutex<Vec<Arc<CursorState>>>,
    /// Live nested transactions begun inside this one. The engine finishes
    /// them together with the parent, so the parent disarms their wrapper
    /// states before its own native call.
    children: Mutex<Vec<Weak<TxnState>>>,
}

// SAFETY: the native transaction is only touched while `lock` is held, and
// the teardown race is settled by `done` under that same lock. The public
// `Transaction` handle stays pinned to its thread; this state crosses
// threads only for the environment's shutdown cascade.
unsafe impl Send for TxnState {}
unsafe impl Sync for TxnState {}

impl TxnState {
    /// Runs `f` with the native handle under the transaction lock.
    pub(crate) fn execute<T>(
        &self,
        f: impl FnOnce(*mut ffi::MDB_txn) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.lock.lock();
        if self.done.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let txn = self.txn.load(Ordering::SeqCst);
        debug_assert!(!txn.is_null());
        f(txn)
    }

    pub(crate) fn register_cursor(&self, cursor: &Arc<CursorState>) {
        self.cursors.lock().push(Arc::clone(cursor));
    }

    pub(crate) fn deregister_cursor(&self, cursor: &CursorState) {
        self.cursors.lock().retain(|tracked| !ptr::eq(tracked.as_ref(), cursor));
    }

    /// Finishes the transaction: exactly one caller performs the native
    /// commit or abort, everyone else gets [`Error::Closed`].
    ///
    /// Teardown order: settle the race, invalidate cursors, then the native
    /// call, then drop the registry entry.
    pub(crate) fn finish(&self, commit: bool) -> Result<()> {
        let _guard = self.lock.lock();
        if self.done.swap(true, Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let txn = self.txn.swap(ptr::null_mut(), Ordering::SeqCst);

        // The engine commits or aborts live children together with the
        // parent; their wrapper states must stop pointing at the handles
        // before the native call frees them.
        for child in self.children.lock().drain(..) {
            if let Some(child) = child.upgrade() {
                child.disarm_tree();
            }
        }

        for cursor in self.cursors.lock().drain(..) {
            // Reader cursors must be closed by hand; writer cursors are
            // freed by the engine together with the transaction.
            cursor.invalidate(self.read_only);
        }

        let result = if commit {
            lmdb_result(unsafe { ffi::mdb_txn_commit(txn) })
        } else {
            unsafe { ffi::mdb_txn_abort(txn) };
            Ok(())
        };
        self.env.inner().untrack_txn(txn as usize);
        tracing::trace!(target: "lmdb_ward", commit, ok = result.is_ok(), "transaction finished");
        result
    }

    /// Aborts unless some path already finished the transaction.
    pub(crate) fn force_abort(&self) {
        let _ = self.finish(false);
    }

    /// Marks the state finished without any native call, for handles the
    /// engine has already released.
    fn disarm(&self) {
        self.done.store(true, Ordering::SeqCst);
        self.txn.store(ptr::null_mut(), Ordering::SeqCst);
    }

    /// Disarms this state and its descendants for a subtree the engine tore
    /// down with an ancestor. No native calls: the handles are already gone.
    fn disarm_tree(&self) {
        let _guard = self.lock.lock();
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let txn = self.txn.swap(ptr::null_mut(), Ordering::SeqCst);
        for child in self.children.lock().drain(..) {
            if let Some(child) = child.upgrade() {
                child.disarm_tree();
            }
        }
        for cursor in self.cursors.lock().drain(..) {
            cursor.invalidate(false);
        }
        self.env.inner().untrack_txn(txn as usize);
    }
}
