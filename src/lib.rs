//! Safe, lifecycle-tracked Rust bindings for LMDB.
//!
//! The engine exposes raw handles with strict validity rules: a transaction
//! must not outlive its environment, a cursor must not outlive its
//! transaction, and none of them may be torn down twice. This crate makes
//! those rules hold by construction:
//!
//! - every handle knows its owner and is invalidated, exactly once, when
//!   the owner finishes, whichever side gets there first;
//! - the read-only / read-write distinction is a type parameter
//!   ([`Transaction<RO>`] / [`Transaction<RW>`]), so misuse fails to
//!   compile instead of failing at run time;
//! - databases are created through a dedicated [`SchemaTransaction`], one
//!   at a time per environment, and only become visible to other
//!   transactions when it commits.
//!
//! Reads decode into owned values via [`TableObject`], so nothing borrowed
//! from the memory map escapes the transaction that mapped it.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![warn(missing_docs, rust_2018_idioms, rustdoc::all)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

/// Raw bindings to the underlying engine, for callers that need to drop
/// below the safe surface.
pub extern crate ffi;

mod codec;
mod compare;
mod cursor;
mod database;
mod environment;
mod error;
mod flags;
mod iter;
mod schema;
mod transaction;

pub use crate::{
    codec::{ObjectLength, TableObject},
    compare::Comparator,
    cursor::{Cursor, FixedMultiCursor, MultiCursor},
    database::{Database, DatabaseConfig, FixedMultiDatabase, MultiDatabase},
    environment::{Environment, Info, Stat},
    error::{Error, Result},
    flags::{DatabaseFlags, EnvironmentFlags, WriteFlags},
    iter::{Dups, FixedChunks, Iter, Keys},
    schema::SchemaTransaction,
    transaction::{Transaction, TransactionKind, RO, RW},
};
