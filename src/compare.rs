//! Bridge for caller-supplied key and duplicate-data orderings.
//!
//! The engine invokes the registered function synchronously during every
//! comparison for the lifetime of the database, from whichever thread runs
//! the transaction. It has no user-data argument, so the bridge is a
//! monomorphized `extern "C"` trampoline per comparator type: the function
//! item itself is the `'static` callable handed to the engine, and there is
//! nothing to keep alive or unregister.

use libc::c_int;
use std::{cmp::Ordering, panic, slice};

/// A caller-supplied ordering over raw byte strings.
///
/// Installed into a database at open time via
/// [`DatabaseConfig::key_comparator`](crate::DatabaseConfig::key_comparator)
/// or [`DatabaseConfig::dup_comparator`](crate::DatabaseConfig::dup_comparator).
///
/// Implementations must be pure byte comparisons: no engine calls, no
/// transaction access. A comparator that panics does not unwind into the
/// engine; the panic is swallowed and the comparison degrades to "equal".
///
/// ```
/// use lmdb_ward::Comparator;
/// use std::cmp::Ordering;
///
/// /// Lexicographic order, reversed.
/// struct ReverseLexical;
///
/// impl Comparator for ReverseLexical {
///     fn compare(a: &[u8], b: &[u8]) -> Ordering {
///         b.cmp(a)
///     }
/// }
/// ```
pub trait Comparator: 'static {
    /// Compares two byte strings, defining the total order the engine uses.
    fn compare(a: &[u8], b: &[u8]) -> Ordering;
}

/// The raw comparison callable the engine expects.
pub(crate) type CompareFn =
    unsafe extern "C" fn(*const ffi::MDB_val, *const ffi::MDB_val) -> c_int;

/// Returns the trampoline for `C`, suitable for `mdb_set_compare` /
/// `mdb_set_dupsort`.
pub(crate) fn bridge<C: Comparator>() -> CompareFn {
    trampoline::<C>
}

unsafe extern "C" fn trampoline<C: Comparator>(
    a: *const ffi::MDB_val,
    b: *const ffi::MDB_val,
) -> c_int {
    let outcome = panic::catch_unwind(|| {
        let a = unsafe { val_bytes(a) };
        let b = unsafe { val_bytes(b) };
        match C::compare(a, b) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    });
    // Unwinding across the foreign boundary is undefined behavior; a
    // panicking comparator yields the fixed sentinel instead.
    outcome.unwrap_or(0)
}

unsafe fn val_bytes<'a>(val: *const ffi::MDB_val) -> &'a [u8] {
    let val = unsafe { &*val };
    if val.mv_data.is_null() {
        &[]
    } else {
        unsafe { slice::from_raw_parts(val.mv_data as *const u8, val.mv_size) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::slice_to_val;

    struct ReverseLexical;

    impl Comparator for ReverseLexical {
        fn compare(a: &[u8], b: &[u8]) -> Ordering {
            b.cmp(a)
        }
    }

    struct Panicking;

    impl Comparator for Panicking {
        fn compare(_: &[u8], _: &[u8]) -> Ordering {
            panic!("comparator bug")
        }
    }

    #[test]
    fn trampoline_reports_ordering() {
        let cmp = bridge::<ReverseLexical>();
        let a = slice_to_val(Some(b"aaa"));
        let b = slice_to_val(Some(b"bbb"));
        assert_eq!(unsafe { cmp(&a, &b) }, 1);
        assert_eq!(unsafe { cmp(&b, &a) }, -1);
        assert_eq!(unsafe { cmp(&a, &a) }, 0);
    }

    #[test]
    fn panics_become_the_sentinel() {
        let cmp = bridge::<Panicking>();
        let a = slice_to_val(Some(b"x"));
        let prev = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));
        let got = unsafe { cmp(&a, &a) };
        panic::set_hook(prev);
        assert_eq!(got, 0);
    }
}
