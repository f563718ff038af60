//! Error types for the wrapper and the underlying engine.

use libc::c_int;
use std::ffi::CStr;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the wrapper.
///
/// The well-known negative LMDB status codes map to dedicated variants; any
/// other non-zero code becomes [`Error::Other`] carrying the engine's own
/// message string. Conditions the wrapper detects before reaching the engine
/// (use of a closed handle, configuration after open, schema-transaction
/// exclusivity, ...) have their own variants and never carry a native code.
///
/// Key-not-found and key-exists-under-`NO_OVERWRITE` are *not* errors; those
/// surface as `Ok(None)` / `Ok(false)` from the operations that can produce
/// them.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// key/data pair already exists
    #[error("key/data pair already exists")]
    KeyExist,
    /// key/data pair not found
    #[error("no matching key/data pair found")]
    NotFound,
    /// requested page not found
    #[error("requested page not found")]
    PageNotFound,
    /// located page was of the wrong type
    #[error("located page was of the wrong type")]
    Corrupted,
    /// update of meta page failed or environment had a fatal error
    #[error("update of meta page failed or environment had a fatal error")]
    Panic,
    /// environment version mismatch
    #[error("environment version mismatch")]
    VersionMismatch,
    /// file is not a valid LMDB file
    #[error("file is not a valid LMDB file")]
    Invalid,
    /// environment map size reached
    #[error("environment map size limit reached")]
    MapFull,
    /// environment maxdbs limit reached
    #[error("environment maxdbs limit reached")]
    DbsFull,
    /// environment maxreaders limit reached
    #[error("environment maxreaders limit reached")]
    ReadersFull,
    /// thread-local storage keys full
    #[error("thread-local storage keys full")]
    TlsFull,
    /// transaction has too many dirty pages
    #[error("transaction has too many dirty pages")]
    TxnFull,
    /// internal cursor stack limit reached
    #[error("internal cursor stack limit reached")]
    CursorFull,
    /// internal page has no more space
    #[error("internal page has no more space")]
    PageFull,
    /// environment map was resized by another process
    #[error("environment map was resized by another process")]
    MapResized,
    /// operation and database incompatible, or database flags changed
    #[error("operation and database incompatible, or database flags changed")]
    Incompatible,
    /// invalid reuse of reader locktable slot
    #[error("invalid reuse of reader locktable slot")]
    BadRslot,
    /// transaction must abort, has a child, or is invalid
    #[error("transaction must abort, has a child, or is invalid")]
    BadTxn,
    /// unsupported size of key/database name/data, or wrong DUP_FIXED size
    #[error("unsupported size of key/database name/data, or wrong DUP_FIXED size")]
    BadValSize,
    /// the specified DBI handle was closed or changed unexpectedly
    #[error("the specified DBI handle was closed or changed unexpectedly")]
    BadDbi,
    /// any other engine status code, with the engine's message verbatim
    #[error("{message} ({code})")]
    Other {
        /// The raw status code returned by the engine.
        code: i32,
        /// The engine's `mdb_strerror` text for that code.
        message: String,
    },

    /// the environment was already opened
    #[error("environment is already open")]
    AlreadyOpen,
    /// map size / max databases / max readers changed after open
    #[error("environment configuration cannot change after open")]
    ConfigAfterOpen,
    /// an operation required an open environment
    #[error("environment is not open")]
    NotOpen,
    /// the handle (environment, transaction, database or cursor) was closed
    #[error("handle is closed")]
    Closed,
    /// a second schema transaction was requested while one is live
    #[error("a schema transaction is already active on this environment")]
    SchemaTransactionActive,
    /// a database with this name already exists in the committed registry
    #[error("database `{0}` already exists")]
    DuplicateName(String),
    /// no committed database with this name
    #[error("no database named `{0}`")]
    DatabaseNotFound(String),
    /// a transaction with the same native handle is already tracked
    #[error("a transaction with the same native handle is already tracked")]
    ConcurrentTransactionId,
    /// `put_multiple` was asked to store more records than the buffer holds
    #[error(
        "buffer of {available} bytes holds fewer than {requested} records of {record_size} bytes"
    )]
    TooManyFixedItems {
        /// Number of records the caller asked to store.
        requested: usize,
        /// Fixed record size declared for the database.
        record_size: usize,
        /// Length of the supplied buffer.
        available: usize,
    },
    /// a cursor read was attempted with no established position
    #[error("cursor is not positioned on a record")]
    InvalidPosition,
    /// a decoded value had an unexpected length
    #[error("decoded value has an unexpected length")]
    Decode,
    /// a path or database name contained an interior NUL byte
    #[error("path or name contains an interior NUL byte")]
    InvalidName,
}

impl Error {
    /// Converts a raw engine status code into an [`Error`].
    pub(crate) fn from_err_code(code: c_int) -> Self {
        match code {
            ffi::MDB_KEYEXIST => Self::KeyExist,
            ffi::MDB_NOTFOUND => Self::NotFound,
            ffi::MDB_PAGE_NOTFOUND => Self::PageNotFound,
            ffi::MDB_CORRUPTED => Self::Corrupted,
            ffi::MDB_PANIC => Self::Panic,
            ffi::MDB_VERSION_MISMATCH => Self::VersionMismatch,
            ffi::MDB_INVALID => Self::Invalid,
            ffi::MDB_MAP_FULL => Self::MapFull,
            ffi::MDB_DBS_FULL => Self::DbsFull,
            ffi::MDB_READERS_FULL => Self::ReadersFull,
            ffi::MDB_TLS_FULL => Self::TlsFull,
            ffi::MDB_TXN_FULL => Self::TxnFull,
            ffi::MDB_CURSOR_FULL => Self::CursorFull,
            ffi::MDB_PAGE_FULL => Self::PageFull,
            ffi::MDB_MAP_RESIZED => Self::MapResized,
            ffi::MDB_INCOMPATIBLE => Self::Incompatible,
            ffi::MDB_BAD_RSLOT => Self::BadRslot,
            ffi::MDB_BAD_TXN => Self::BadTxn,
            ffi::MDB_BAD_VALSIZE => Self::BadValSize,
            ffi::MDB_BAD_DBI => Self::BadDbi,
            other => {
                // mdb_strerror falls back to the libc strerror table for
                // plain errno values, so the message is never empty.
                let message = unsafe { CStr::from_ptr(ffi::mdb_strerror(other)) }
                    .to_string_lossy()
                    .into_owned();
                Self::Other { code: other, message }
            }
        }
    }
}

/// Converts an engine status code into `Ok(())` or the mapped [`Error`].
#[inline]
pub(crate) fn lmdb_result(code: c_int) -> Result<()> {
    if code == ffi::MDB_SUCCESS as c_int {
        Ok(())
    } else {
        Err(Error::from_err_code(code))
    }
}
