//! Flag catalogs for environments, databases and write operations.

use bitflags::bitflags;
use libc::c_uint;

bitflags! {
    /// Environment options, applied at [`Environment::open_with`](crate::Environment::open_with).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EnvironmentFlags: c_uint {
        /// Use a fixed address for the memory map.
        const FIXED_MAP = ffi::MDB_FIXEDMAP;
        /// The path is a file, not a directory.
        const NO_SUB_DIR = ffi::MDB_NOSUBDIR;
        /// Open the environment read-only.
        const READ_ONLY = ffi::MDB_RDONLY;
        /// Use a writable memory map instead of malloc/msync.
        const WRITE_MAP = ffi::MDB_WRITEMAP;
        /// Flush system buffers to disk only once per transaction.
        const NO_META_SYNC = ffi::MDB_NOMETASYNC;
        /// Don't flush system buffers to disk when committing.
        const NO_SYNC = ffi::MDB_NOSYNC;
        /// Use asynchronous flushes to disk (with `WRITE_MAP`).
        const MAP_ASYNC = ffi::MDB_MAPASYNC;
        /// Tie reader locktable slots to transaction objects instead of
        /// threads. Required to run multiple read-only transactions on one
        /// thread.
        const NO_TLS = ffi::MDB_NOTLS;
        /// Don't do any locking; caller manages concurrency.
        const NO_LOCK = ffi::MDB_NOLOCK;
        /// Don't do readahead.
        const NO_READAHEAD = ffi::MDB_NORDAHEAD;
        /// Don't initialize malloc'd memory before writing to the datafile.
        const NO_MEM_INIT = ffi::MDB_NOMEMINIT;
    }
}

bitflags! {
    /// Per-database options, fixed when the database is first created.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DatabaseFlags: c_uint {
        /// Keys are compared in reverse order, from the end of the key to
        /// the beginning.
        const REVERSE_KEY = ffi::MDB_REVERSEKEY;
        /// Keys may have multiple data items, stored in sorted order.
        const DUP_SORT = ffi::MDB_DUPSORT;
        /// Keys are binary integers in native byte order.
        const INTEGER_KEY = ffi::MDB_INTEGERKEY;
        /// With `DUP_SORT`, all data items for a key have the same size.
        const DUP_FIXED = ffi::MDB_DUPFIXED;
        /// With `DUP_SORT`, duplicate data items are binary integers.
        const INTEGER_DUP = ffi::MDB_INTEGERDUP;
        /// With `DUP_SORT`, duplicate data items are compared in reverse
        /// order.
        const REVERSE_DUP = ffi::MDB_REVERSEDUP;
        /// Create the database if it doesn't already exist.
        const CREATE = ffi::MDB_CREATE;
    }
}

bitflags! {
    /// Options for put and delete operations.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct WriteFlags: c_uint {
        /// Don't replace an existing key; the put reports `false` instead.
        const NO_OVERWRITE = ffi::MDB_NOOVERWRITE;
        /// Don't add a duplicate (key, data) pair; the put reports `false`
        /// instead. Only meaningful for `DUP_SORT` databases.
        const NO_DUP_DATA = ffi::MDB_NODUPDATA;
        /// Replace the item at the cursor's current position.
        const CURRENT = ffi::MDB_CURRENT;
        /// Reserve space for data of the given size, returning a buffer to
        /// fill in later.
        const RESERVE = ffi::MDB_RESERVE;
        /// Append the given key/data pair to the end of the database.
        const APPEND = ffi::MDB_APPEND;
        /// Append the given key/data pair to the end of the duplicate list.
        const APPEND_DUP = ffi::MDB_APPENDDUP;
        /// Store multiple contiguous fixed-size data items in one call.
        const MULTIPLE = ffi::MDB_MULTIPLE;
    }
}
