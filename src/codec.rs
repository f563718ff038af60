//! Decoding of engine values into caller types.
//!
//! Every byte range handed back by the engine is only valid until the next
//! positioning or mutating call on the same transaction, so the wrapper
//! decodes into owned values at the foreign boundary instead of lending
//! references into the map.

use crate::error::{Error, Result};
use libc::c_void;
use std::{ptr, slice};

/// Decodes values read from the engine into Rust types.
///
/// Implement this to read custom types directly from positioning verbs and
/// iterators:
///
/// ```
/// use lmdb_ward::{Error, Result, TableObject};
///
/// struct Hash([u8; 32]);
///
/// impl TableObject for Hash {
///     fn decode(data: &[u8]) -> Result<Self> {
///         Ok(Self(data.try_into().map_err(|_| Error::Decode)?))
///     }
/// }
/// ```
pub trait TableObject: Sized {
    /// Decodes the object from the given bytes.
    fn decode(data: &[u8]) -> Result<Self>;
}

impl TableObject for Vec<u8> {
    fn decode(data: &[u8]) -> Result<Self> {
        Ok(data.to_vec())
    }
}

impl TableObject for () {
    fn decode(_: &[u8]) -> Result<Self> {
        Ok(())
    }
}

/// If you don't need the data itself, just its length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectLength(
    /// The stored value's length in bytes.
    pub usize,
);

impl TableObject for ObjectLength {
    fn decode(data: &[u8]) -> Result<Self> {
        Ok(Self(data.len()))
    }
}

impl std::ops::Deref for ObjectLength {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const LEN: usize> TableObject for [u8; LEN] {
    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != LEN {
            return Err(Error::Decode);
        }
        let mut out = [0; LEN];
        out.copy_from_slice(data);
        Ok(out)
    }
}

/// Decodes an `MDB_val` filled in by the engine.
///
/// # Safety
///
/// `val` must either hold a null `mv_data` or point to `mv_size` readable
/// bytes, and the owning transaction must still be live.
pub(crate) unsafe fn decode_val<T: TableObject>(val: &ffi::MDB_val) -> Result<T> {
    // Some positioning verbs (MDB_SET, the *_DUP family) leave the key
    // untouched; a null val decodes as empty.
    if val.mv_data.is_null() {
        return T::decode(&[]);
    }
    T::decode(unsafe { slice::from_raw_parts(val.mv_data as *const u8, val.mv_size) })
}

/// Builds an `MDB_val` describing the given input slice, or an empty one the
/// engine is expected to fill in.
pub(crate) fn slice_to_val(slice: Option<&[u8]>) -> ffi::MDB_val {
    match slice {
        Some(slice) => {
            ffi::MDB_val { mv_size: slice.len(), mv_data: slice.as_ptr() as *mut c_void }
        }
        None => ffi::MDB_val { mv_size: 0, mv_data: ptr::null_mut() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_copies_bytes() {
        assert_eq!(Vec::<u8>::decode(b"abc").unwrap(), b"abc".to_vec());
    }

    #[test]
    fn unit_ignores_data() {
        <()>::decode(b"whatever").unwrap();
    }

    #[test]
    fn object_length_reports_len() {
        assert_eq!(*ObjectLength::decode(b"four").unwrap(), 4);
    }

    #[test]
    fn array_requires_exact_len() {
        assert_eq!(<[u8; 3]>::decode(b"abc").unwrap(), *b"abc");
        assert_eq!(<[u8; 4]>::decode(b"abc").unwrap_err(), Error::Decode);
    }

    #[test]
    fn null_val_decodes_as_empty() {
        let val = slice_to_val(None);
        assert_eq!(unsafe { decode_val::<Vec<u8>>(&val) }.unwrap(), Vec::<u8>::new());
    }
}
