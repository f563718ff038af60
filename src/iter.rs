//! Lazy, single-pass iterators over cursors.
//!
//! Each `next` call issues exactly one positioning verb; nothing is read
//! ahead or buffered. An iterator ends (and stays ended) at the first
//! `Ok(None)` or error from the cursor.

use crate::{
    codec::TableObject,
    cursor::{Cursor, FixedMultiCursor},
    error::{Error, Result},
    transaction::TransactionKind,
};
use libc::c_uint;
use std::{iter::FusedIterator, marker::PhantomData, mem};

/// Iterator over `(key, value)` pairs, driven by a pair of positioning
/// verbs: `op` for the first step, `next_op` for every step after.
pub struct Iter<'cur, K, Key = Vec<u8>, Value = Vec<u8>>
where
    K: TransactionKind,
    Key: TableObject,
    Value: TableObject,
{
    /// Cleared once the sequence ends; keeps the iterator fused.
    cursor: Option<&'cur Cursor<K>>,
    op: c_uint,
    next_op: c_uint,
    /// A positioning error from the constructor, surfaced on the first
    /// `next` call.
    error: Option<Error>,
    _decoded: PhantomData<fn() -> (Key, Value)>,
}

impl<'cur, K, Key, Value> Iter<'cur, K, Key, Value>
where
    K: TransactionKind,
    Key: TableObject,
    Value: TableObject,
{
    pub(crate) fn new(cursor: &'cur Cursor<K>, op: c_uint, next_op: c_uint) -> Self {
        Self { cursor: Some(cursor), op, next_op, error: None, _decoded: PhantomData }
    }

    /// An iterator that yields nothing; used when the seek found no entry.
    pub(crate) fn empty() -> Self {
        Self { cursor: None, op: 0, next_op: 0, error: None, _decoded: PhantomData }
    }

    /// An iterator that yields one error; used when the seek itself failed.
    pub(crate) fn failed(error: Error) -> Self {
        Self { cursor: None, op: 0, next_op: 0, error: Some(error), _decoded: PhantomData }
    }
}

impl<K, Key, Value> Iterator for Iter<'_, K, Key, Value>
where
    K: TransactionKind,
    Key: TableObject,
    Value: TableObject,
{
    type Item = Result<(Key, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(error) = self.error.take() {
            return Some(Err(error));
        }
        let cursor = self.cursor?;
        let op = mem::replace(&mut self.op, self.next_op);
        match cursor.get_op(None, None, op) {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => {
                self.cursor = None;
                None
            }
            Err(error) => {
                self.cursor = None;
                Some(Err(error))
            }
        }
    }
}

impl<K, Key, Value> FusedIterator for Iter<'_, K, Key, Value>
where
    K: TransactionKind,
    Key: TableObject,
    Value: TableObject,
{
}

/// Iterator over keys only, skipping the value decode.
pub struct Keys<'cur, K, Key = Vec<u8>>
where
    K: TransactionKind,
    Key: TableObject,
{
    inner: Iter<'cur, K, Key, ()>,
}

impl<'cur, K, Key> Keys<'cur, K, Key>
where
    K: TransactionKind,
    Key: TableObject,
{
    pub(crate) fn new(inner: Iter<'cur, K, Key, ()>) -> Self {
        Self { inner }
    }
}

impl<K, Key> Iterator for Keys<'_, K, Key>
where
    K: TransactionKind,
    Key: TableObject,
{
    type Item = Result<Key>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.inner.next()?.map(|(key, ())| key))
    }
}

impl<K, Key> FusedIterator for Keys<'_, K, Key>
where
    K: TransactionKind,
    Key: TableObject,
{
}

/// Iterator over the duplicate values of one key, skipping the key decode.
pub struct Dups<'cur, K, Value = Vec<u8>>
where
    K: TransactionKind,
    Value: TableObject,
{
    inner: Iter<'cur, K, (), Value>,
}

impl<'cur, K, Value> Dups<'cur, K, Value>
where
    K: TransactionKind,
    Value: TableObject,
{
    pub(crate) fn new(inner: Iter<'cur, K, (), Value>) -> Self {
        Self { inner }
    }
}

impl<K, Value> Iterator for Dups<'_, K, Value>
where
    K: TransactionKind,
    Value: TableObject,
{
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.inner.next()?.map(|((), value)| value))
    }
}

impl<K, Value> FusedIterator for Dups<'_, K, Value>
where
    K: TransactionKind,
    Value: TableObject,
{
}

enum ChunkStep {
    Seek(Vec<u8>),
    Stream,
    Done,
}

/// Iterator over the duplicates of one key in page-sized batches, for
/// fixed-record databases.
pub struct FixedChunks<'cur, K, T>
where
    K: TransactionKind,
    T: TableObject,
{
    cursor: &'cur FixedMultiCursor<K>,
    step: ChunkStep,
    _decoded: PhantomData<fn() -> T>,
}

impl<'cur, K, T> FixedChunks<'cur, K, T>
where
    K: TransactionKind,
    T: TableObject,
{
    pub(crate) fn new(cursor: &'cur FixedMultiCursor<K>, key: &[u8]) -> Self {
        Self { cursor, step: ChunkStep::Seek(key.to_vec()), _decoded: PhantomData }
    }
}

impl<K, T> Iterator for FixedChunks<'_, K, T>
where
    K: TransactionKind,
    T: TableObject,
{
    type Item = Result<Vec<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = match mem::replace(&mut self.step, ChunkStep::Stream) {
            ChunkStep::Seek(key) => self.cursor.get_multiple(&key),
            ChunkStep::Stream => self.cursor.next_multiple(),
            ChunkStep::Done => {
                self.step = ChunkStep::Done;
                return None;
            }
        };
        match result {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.step = ChunkStep::Done;
                None
            }
            Err(error) => {
                self.step = ChunkStep::Done;
                Some(Err(error))
            }
        }
    }
}

impl<K, T> FusedIterator for FixedChunks<'_, K, T>
where
    K: TransactionKind,
    T: TableObject,
{
}
