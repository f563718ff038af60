//! Cursors: stateful positions inside a database, scoped to one
//! transaction.
//!
//! A cursor is owned by the transaction that opened it and never outlives
//! it: whichever path finishes the transaction invalidates its cursors
//! first, so a stale cursor fails with [`Error::Closed`] instead of touching
//! freed engine state.

use crate::{
    codec::{decode_val, slice_to_val, TableObject},
    database::{put_outcome, Database},
    error::{lmdb_result, Error, Result},
    flags::WriteFlags,
    iter::{Dups, FixedChunks, Iter, Keys},
    transaction::{Transaction, TransactionKind, TxnState, RO, RW},
};
use libc::{c_uint, c_void};
use std::{
    fmt,
    marker::PhantomData,
    ptr,
    sync::{atomic::AtomicPtr, atomic::Ordering, Arc},
};

/// Shared slot for a native cursor handle, reachable from the public
/// [`Cursor`] and from the owning transaction's teardown list.
pub(crate) struct CursorState {
    /// Null once invalidated.
    cursor: AtomicPtr<ffi::MDB_cursor>,
}

// SAFETY: the pointer is only dereferenced under the owning transaction's
// lock; the slot itself is a plain atomic.
unsafe impl Send for CursorState {}
unsafe impl Sync for CursorState {}

impl CursorState {
    pub(crate) fn open(txn: &Arc<TxnState>, dbi: ffi::MDB_dbi) -> Result<Arc<Self>> {
        // Registration happens under the transaction lock so the teardown
        // path cannot slip between open and register.
        txn.execute(|txn_ptr| {
            let mut cursor: *mut ffi::MDB_cursor = ptr::null_mut();
            lmdb_result(unsafe { ffi::mdb_cursor_open(txn_ptr, dbi, &mut cursor) })?;
            let state = Arc::new(Self { cursor: AtomicPtr::new(cursor) });
            txn.register_cursor(&state);
            Ok(state)
        })
    }

    fn ptr(&self) -> Result<*mut ffi::MDB_cursor> {
        let cursor = self.cursor.load(Ordering::SeqCst);
        if cursor.is_null() {
            return Err(Error::Closed);
        }
        Ok(cursor)
    }

    /// Clears the slot, optionally closing the native cursor. Callers must
    /// hold the owning transaction's lock when `close_native` is set.
    pub(crate) fn invalidate(&self, close_native: bool) {
        let cursor = self.cursor.swap(ptr::null_mut(), Ordering::SeqCst);
        if close_native && !cursor.is_null() {
            unsafe { ffi::mdb_cursor_close(cursor) };
        }
    }
}

/// A cursor over a [`Database`], bound to the transaction that opened it.
///
/// Positioning verbs return `Ok(None)` past either end of the range;
/// [`get_current`](Self::get_current) on a cursor that was never positioned
/// fails with [`Error::InvalidPosition`].
pub struct Cursor<K: TransactionKind> {
    txn: Arc<TxnState>,
    state: Arc<CursorState>,
    /// Like the transaction it belongs to, a cursor never leaves its thread.
    _mode: PhantomData<(K, *mut ffi::MDB_cursor)>,
}

impl<K: TransactionKind> Cursor<K> {
    pub(crate) fn new(txn: &Transaction<K>, db: &Database) -> Result<Self> {
        let state = db.new_cursor_state(txn)?;
        Ok(Self { txn: Arc::clone(txn.state()), state, _mode: PhantomData })
    }

    /// Issues one positioning verb under the transaction lock.
    pub(crate) fn get_op<Key, Value>(
        &self,
        key: Option<&[u8]>,
        data: Option<&[u8]>,
        op: c_uint,
    ) -> Result<Option<(Key, Value)>>
    where
        Key: TableObject,
        Value: TableObject,
    {
        self.txn.execute(|_| {
            let cursor = self.state.ptr()?;
            let mut key_val = slice_to_val(key);
            let mut data_val = slice_to_val(data);
            match unsafe { ffi::mdb_cursor_get(cursor, &mut key_val, &mut data_val, op) } {
                ffi::MDB_SUCCESS => unsafe {
                    Ok(Some((decode_val(&key_val)?, decode_val(&data_val)?)))
                },
                ffi::MDB_NOTFOUND => Ok(None),
                // The engine reports EINVAL for "no current position".
                code if code == libc::EINVAL && op == ffi::MDB_GET_CURRENT => {
                    Err(Error::InvalidPosition)
                }
                code => Err(Error::from_err_code(code)),
            }
        })
    }

    fn value_op<Value: TableObject>(
        &self,
        key: Option<&[u8]>,
        data: Option<&[u8]>,
        op: c_uint,
    ) -> Result<Option<Value>> {
        Ok(self.get_op::<(), Value>(key, data, op)?.map(|(_, value)| value))
    }

    /// Positions at the first entry.
    pub fn first<Key, Value>(&self) -> Result<Option<(Key, Value)>>
    where
        Key: TableObject,
        Value: TableObject,
    {
        self.get_op(None, None, ffi::MDB_FIRST)
    }

    /// Positions at the last entry.
    pub fn last<Key, Value>(&self) -> Result<Option<(Key, Value)>>
    where
        Key: TableObject,
        Value: TableObject,
    {
        self.get_op(None, None, ffi::MDB_LAST)
    }

    /// Advances to the next entry; from a fresh cursor, the first entry.
    pub fn next<Key, Value>(&self) -> Result<Option<(Key, Value)>>
    where
        Key: TableObject,
        Value: TableObject,
    {
        self.get_op(None, None, ffi::MDB_NEXT)
    }

    /// Steps back to the previous entry.
    pub fn prev<Key, Value>(&self) -> Result<Option<(Key, Value)>>
    where
        Key: TableObject,
        Value: TableObject,
    {
        self.get_op(None, None, ffi::MDB_PREV)
    }

    /// Re-reads the entry at the current position.
    pub fn get_current<Key, Value>(&self) -> Result<Option<(Key, Value)>>
    where
        Key: TableObject,
        Value: TableObject,
    {
        self.get_op(None, None, ffi::MDB_GET_CURRENT)
    }

    /// Positions at `key` exactly, returning its value.
    pub fn set<Value: TableObject>(&self, key: &[u8]) -> Result<Option<Value>> {
        self.value_op(Some(key), None, ffi::MDB_SET)
    }

    /// Positions at `key` exactly, returning the stored key and value.
    pub fn set_key<Key, Value>(&self, key: &[u8]) -> Result<Option<(Key, Value)>>
    where
        Key: TableObject,
        Value: TableObject,
    {
        self.get_op(Some(key), None, ffi::MDB_SET_KEY)
    }

    /// Positions at the first key greater than or equal to `key`.
    pub fn set_range<Key, Value>(&self, key: &[u8]) -> Result<Option<(Key, Value)>>
    where
        Key: TableObject,
        Value: TableObject,
    {
        self.get_op(Some(key), None, ffi::MDB_SET_RANGE)
    }

    /// Iterates forward from the position after the current one; over the
    /// whole database from a fresh cursor.
    pub fn iter<Key, Value>(&mut self) -> Iter<'_, K, Key, Value>
    where
        Key: TableObject,
        Value: TableObject,
    {
        Iter::new(self, ffi::MDB_NEXT, ffi::MDB_NEXT)
    }

    /// Iterates forward over the whole database.
    pub fn iter_start<Key, Value>(&mut self) -> Iter<'_, K, Key, Value>
    where
        Key: TableObject,
        Value: TableObject,
    {
        Iter::new(self, ffi::MDB_FIRST, ffi::MDB_NEXT)
    }

    /// Iterates backward from the position before the current one.
    pub fn iter_back<Key, Value>(&mut self) -> Iter<'_, K, Key, Value>
    where
        Key: TableObject,
        Value: TableObject,
    {
        Iter::new(self, ffi::MDB_PREV, ffi::MDB_PREV)
    }

    /// Iterates backward over the whole database.
    pub fn iter_end<Key, Value>(&mut self) -> Iter<'_, K, Key, Value>
    where
        Key: TableObject,
        Value: TableObject,
    {
        Iter::new(self, ffi::MDB_LAST, ffi::MDB_PREV)
    }

    /// Iterates forward from the first key greater than or equal to `key`.
    pub fn iter_from<Key, Value>(&mut self, key: &[u8]) -> Iter<'_, K, Key, Value>
    where
        Key: TableObject,
        Value: TableObject,
    {
        match self.get_op::<(), ()>(Some(key), None, ffi::MDB_SET_RANGE) {
            Ok(Some(_)) => Iter::new(self, ffi::MDB_GET_CURRENT, ffi::MDB_NEXT),
            Ok(None) => Iter::empty(),
            Err(err) => Iter::failed(err),
        }
    }

    /// Iterates forward over distinct keys, skipping duplicate values.
    pub fn iter_keys<Key: TableObject>(&mut self) -> Keys<'_, K, Key> {
        Keys::new(Iter::new(self, ffi::MDB_NEXT_NODUP, ffi::MDB_NEXT_NODUP))
    }

    /// Iterates forward over all distinct keys from the start.
    pub fn iter_keys_start<Key: TableObject>(&mut self) -> Keys<'_, K, Key> {
        Keys::new(Iter::new(self, ffi::MDB_FIRST, ffi::MDB_NEXT_NODUP))
    }

    /// Closes the cursor. Equivalent to dropping it.
    pub fn close(self) {}
}

impl Cursor<RW> {
    /// Stores `data` under `key` at/near the cursor, per `flags`. The same
    /// conditional-write outcome rules as [`Database::put`] apply.
    pub fn put(&self, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<bool> {
        self.txn.execute(|_| {
            let cursor = self.state.ptr()?;
            let mut key_val = slice_to_val(Some(key));
            let mut data_val = slice_to_val(Some(data));
            let code = unsafe {
                ffi::mdb_cursor_put(cursor, &mut key_val, &mut data_val, flags.bits())
            };
            put_outcome(code, flags)
        })
    }

    /// Deletes the entry at the current position. With
    /// [`WriteFlags::NO_DUP_DATA`], deletes every duplicate of the current
    /// key.
    pub fn del(&self, flags: WriteFlags) -> Result<()> {
        self.txn.execute(|_| {
            let cursor = self.state.ptr()?;
            lmdb_result(unsafe { ffi::mdb_cursor_del(cursor, flags.bits()) })
        })
    }
}

impl Cursor<RO> {
    /// Rebinds the cursor to `txn`, clearing any previous position. `txn`
    /// may be the cursor's own transaction after a
    /// [`renew`](Transaction::renew), or a different read-only transaction
    /// entirely; ownership moves with the rebind.
    pub fn renew(&mut self, txn: &Transaction<RO>) -> Result<()> {
        let new_owner = Arc::clone(txn.state());
        // Detach from the current owner first so its teardown can no longer
        // close the handle; a reader cursor stays allocated after its
        // transaction finishes.
        self.txn.deregister_cursor(&self.state);
        let rebound = new_owner.execute(|txn_ptr| {
            let cursor = self.state.ptr()?;
            lmdb_result(unsafe { ffi::mdb_cursor_renew(txn_ptr, cursor) })?;
            new_owner.register_cursor(&self.state);
            Ok(())
        });
        match rebound {
            Ok(()) => {
                self.txn = new_owner;
                Ok(())
            }
            Err(err) => {
                // Detached and unrebindable: release the native handle now.
                self.state.invalidate(true);
                Err(err)
            }
        }
    }
}

impl<K: TransactionKind> Drop for Cursor<K> {
    fn drop(&mut self) {
        // Close natively only while the transaction is still live; after it
        // finished, the teardown already dealt with the native handle. The
        // invalidation must come before deregistration so the handle can
        // never fall between the two owners.
        let _ = self.txn.execute(|_| {
            self.state.invalidate(true);
            Ok(())
        });
        self.txn.deregister_cursor(&self.state);
    }
}

impl<K: TransactionKind> fmt::Debug for Cursor<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor").field("open", &self.state.ptr().is_ok()).finish()
    }
}

/// A cursor over a [`MultiDatabase`](crate::MultiDatabase), adding the
/// duplicate-aware verbs.
pub struct MultiCursor<K: TransactionKind> {
    cursor: Cursor<K>,
}

impl<K: TransactionKind> MultiCursor<K> {
    pub(crate) fn new(txn: &Transaction<K>, db: &Database) -> Result<Self> {
        Ok(Self { cursor: Cursor::new(txn, db)? })
    }

    /// Positions at the first duplicate of the current key.
    pub fn first_dup<Value: TableObject>(&self) -> Result<Option<Value>> {
        self.cursor.value_op(None, None, ffi::MDB_FIRST_DUP)
    }

    /// Positions at the last duplicate of the current key.
    pub fn last_dup<Value: TableObject>(&self) -> Result<Option<Value>> {
        self.cursor.value_op(None, None, ffi::MDB_LAST_DUP)
    }

    /// Advances to the next duplicate of the current key.
    pub fn next_dup<Key, Value>(&self) -> Result<Option<(Key, Value)>>
    where
        Key: TableObject,
        Value: TableObject,
    {
        self.cursor.get_op(None, None, ffi::MDB_NEXT_DUP)
    }

    /// Steps back to the previous duplicate of the current key.
    pub fn prev_dup<Key, Value>(&self) -> Result<Option<(Key, Value)>>
    where
        Key: TableObject,
        Value: TableObject,
    {
        self.cursor.get_op(None, None, ffi::MDB_PREV_DUP)
    }

    /// Advances to the first duplicate of the next key.
    pub fn next_nodup<Key, Value>(&self) -> Result<Option<(Key, Value)>>
    where
        Key: TableObject,
        Value: TableObject,
    {
        self.cursor.get_op(None, None, ffi::MDB_NEXT_NODUP)
    }

    /// Steps back to the last duplicate of the previous key.
    pub fn prev_nodup<Key, Value>(&self) -> Result<Option<(Key, Value)>>
    where
        Key: TableObject,
        Value: TableObject,
    {
        self.cursor.get_op(None, None, ffi::MDB_PREV_NODUP)
    }

    /// Positions at the exact `(key, data)` pair.
    pub fn get_both<Value: TableObject>(
        &self,
        key: &[u8],
        data: &[u8],
    ) -> Result<Option<Value>> {
        self.cursor.value_op(Some(key), Some(data), ffi::MDB_GET_BOTH)
    }

    /// Positions at `key` and the first duplicate greater than or equal to
    /// `data`.
    pub fn get_both_range<Value: TableObject>(
        &self,
        key: &[u8],
        data: &[u8],
    ) -> Result<Option<Value>> {
        self.cursor.value_op(Some(key), Some(data), ffi::MDB_GET_BOTH_RANGE)
    }

    /// Number of duplicates of the current key.
    pub fn count(&self) -> Result<usize> {
        self.cursor.txn.execute(|_| {
            let cursor = self.cursor.state.ptr()?;
            let mut count: usize = 0;
            match unsafe { ffi::mdb_cursor_count(cursor, &mut count) } {
                ffi::MDB_SUCCESS => Ok(count),
                code if code == libc::EINVAL => Err(Error::InvalidPosition),
                code => Err(Error::from_err_code(code)),
            }
        })
    }

    /// Iterates every `(key, value)` pair from the start, duplicates
    /// included.
    pub fn iter_dups<Key, Value>(&mut self) -> Iter<'_, K, Key, Value>
    where
        Key: TableObject,
        Value: TableObject,
    {
        Iter::new(&self.cursor, ffi::MDB_FIRST, ffi::MDB_NEXT)
    }

    /// Iterates the duplicates of `key`, in duplicate order.
    pub fn iter_dups_of<Value: TableObject>(&mut self, key: &[u8]) -> Dups<'_, K, Value> {
        match self.cursor.get_op::<(), ()>(Some(key), None, ffi::MDB_SET) {
            Ok(Some(_)) => {
                Dups::new(Iter::new(&self.cursor, ffi::MDB_GET_CURRENT, ffi::MDB_NEXT_DUP))
            }
            Ok(None) => Dups::new(Iter::empty()),
            Err(err) => Dups::new(Iter::failed(err)),
        }
    }

    /// Iterates the duplicates of `key` in reverse duplicate order.
    pub fn iter_dups_of_reverse<Value: TableObject>(
        &mut self,
        key: &[u8],
    ) -> Dups<'_, K, Value> {
        match self.cursor.get_op::<(), ()>(Some(key), None, ffi::MDB_SET) {
            Ok(Some(_)) => {
                Dups::new(Iter::new(&self.cursor, ffi::MDB_LAST_DUP, ffi::MDB_PREV_DUP))
            }
            Ok(None) => Dups::new(Iter::empty()),
            Err(err) => Dups::new(Iter::failed(err)),
        }
    }
}

impl<K: TransactionKind> std::ops::Deref for MultiCursor<K> {
    type Target = Cursor<K>;

    fn deref(&self) -> &Self::Target {
        &self.cursor
    }
}

impl<K: TransactionKind> std::ops::DerefMut for MultiCursor<K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.cursor
    }
}

impl<K: TransactionKind> fmt::Debug for MultiCursor<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiCursor").field("open", &self.cursor.state.ptr().is_ok()).finish()
    }
}

/// A cursor over a [`FixedMultiDatabase`](crate::FixedMultiDatabase),
/// adding the page-at-a-time bulk verbs.
pub struct FixedMultiCursor<K: TransactionKind> {
    cursor: MultiCursor<K>,
    record_size: usize,
}

impl<K: TransactionKind> FixedMultiCursor<K> {
    pub(crate) fn new(txn: &Transaction<K>, db: &Database, record_size: usize) -> Result<Self> {
        Ok(Self { cursor: MultiCursor::new(txn, db)?, record_size })
    }

    /// The declared record size, in bytes.
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Positions at `key` and returns its first page worth of duplicates,
    /// decoded record by record.
    pub fn get_multiple<T: TableObject>(&self, key: &[u8]) -> Result<Option<Vec<T>>> {
        if self.cursor.cursor.get_op::<(), ()>(Some(key), None, ffi::MDB_SET)?.is_none() {
            return Ok(None);
        }
        self.chunk_op(ffi::MDB_GET_MULTIPLE)
    }

    /// Returns the next page worth of duplicates of the current key.
    pub fn next_multiple<T: TableObject>(&self) -> Result<Option<Vec<T>>> {
        self.chunk_op(ffi::MDB_NEXT_MULTIPLE)
    }

    /// Returns the previous page worth of duplicates of the current key.
    pub fn prev_multiple<T: TableObject>(&self) -> Result<Option<Vec<T>>> {
        self.chunk_op(ffi::MDB_PREV_MULTIPLE)
    }

    /// Iterates every duplicate of `key` in page-sized batches.
    pub fn iter_multiple<T: TableObject>(&mut self, key: &[u8]) -> FixedChunks<'_, K, T> {
        FixedChunks::new(self, key)
    }

    /// One bulk verb: the engine hands back a contiguous buffer of
    /// `record_size`-byte items, sliced and decoded here.
    fn chunk_op<T: TableObject>(&self, op: c_uint) -> Result<Option<Vec<T>>> {
        let record_size = self.record_size;
        self.cursor.cursor.txn.execute(|_| {
            let cursor = self.cursor.cursor.state.ptr()?;
            let mut key_val = slice_to_val(None);
            let mut data_val = slice_to_val(None);
            match unsafe { ffi::mdb_cursor_get(cursor, &mut key_val, &mut data_val, op) } {
                ffi::MDB_SUCCESS => {
                    let buf = unsafe {
                        std::slice::from_raw_parts(data_val.mv_data as *const u8, data_val.mv_size)
                    };
                    buf.chunks_exact(record_size).map(T::decode).collect::<Result<Vec<_>>>().map(Some)
                }
                ffi::MDB_NOTFOUND => Ok(None),
                code => Err(Error::from_err_code(code)),
            }
        })
    }
}

impl FixedMultiCursor<RW> {
    /// Stores `count` records from the contiguous `records` buffer under
    /// `key` in one call. Returns how many the engine actually wrote.
    pub fn put_multiple(
        &self,
        key: &[u8],
        records: &[u8],
        count: usize,
        flags: WriteFlags,
    ) -> Result<usize> {
        let record_size = self.record_size;
        match count.checked_mul(record_size) {
            Some(needed) if needed <= records.len() => {}
            _ => {
                return Err(Error::TooManyFixedItems {
                    requested: count,
                    record_size,
                    available: records.len(),
                })
            }
        }
        self.cursor.cursor.txn.execute(|_| {
            let cursor = self.cursor.cursor.state.ptr()?;
            let mut key_val = slice_to_val(Some(key));
            // The bulk put takes two MDB_vals: the first describes one
            // record and the buffer start, the second carries the count in
            // mv_size and reports back how many were written.
            let mut data_vals = [
                ffi::MDB_val { mv_size: record_size, mv_data: records.as_ptr() as *mut c_void },
                ffi::MDB_val { mv_size: count, mv_data: ptr::null_mut() },
            ];
            lmdb_result(unsafe {
                ffi::mdb_cursor_put(
                    cursor,
                    &mut key_val,
                    data_vals.as_mut_ptr(),
                    (flags | WriteFlags::MULTIPLE).bits(),
                )
            })?;
            Ok(data_vals[1].mv_size)
        })
    }
}

impl<K: TransactionKind> std::ops::Deref for FixedMultiCursor<K> {
    type Target = MultiCursor<K>;

    fn deref(&self) -> &Self::Target {
        &self.cursor
    }
}

impl<K: TransactionKind> std::ops::DerefMut for FixedMultiCursor<K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.cursor
    }
}

impl<K: TransactionKind> fmt::Debug for FixedMultiCursor<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedMultiCursor")
            .field("record_size", &self.record_size)
            .finish_non_exhaustive()
    }
}
