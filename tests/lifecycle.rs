//! Ownership-graph behavior: configuration gates, schema exclusivity,
//! publish-on-commit and cascading invalidation.

use lmdb_ward::{
    DatabaseConfig, Environment, EnvironmentFlags, Error, WriteFlags,
};
use tempfile::tempdir;

fn open_env(max_dbs: u32) -> (tempfile::TempDir, Environment) {
    let dir = tempdir().unwrap();
    let env = Environment::new();
    env.set_map_size(1 << 24).unwrap();
    env.set_max_dbs(max_dbs).unwrap();
    env.open(dir.path()).unwrap();
    (dir, env)
}

#[test]
fn single_named_database_roundtrip() {
    let (_dir, env) = open_env(1);

    let schema = env.begin_schema_txn().unwrap();
    let db = schema.open_database(Some("A"), &DatabaseConfig::default()).unwrap();
    schema.commit().unwrap();

    let txn = env.begin_rw_txn().unwrap();
    assert!(db.put(&txn, b"k", b"v", WriteFlags::empty()).unwrap());
    txn.commit().unwrap();

    // Lookup is case-insensitive.
    let db = env.database(Some("a")).unwrap();
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get::<_, Vec<u8>>(&txn, b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn configuration_locks_at_open() {
    let dir = tempdir().unwrap();
    let env = Environment::new();
    env.set_map_size(1 << 24).unwrap();
    env.open(dir.path()).unwrap();

    assert_eq!(env.set_map_size(1 << 25).unwrap_err(), Error::ConfigAfterOpen);
    assert_eq!(env.set_max_dbs(2).unwrap_err(), Error::ConfigAfterOpen);
    assert_eq!(env.open(dir.path()).unwrap_err(), Error::AlreadyOpen);
}

#[test]
fn operations_require_an_open_environment() {
    let env = Environment::new();
    assert_eq!(env.begin_ro_txn().unwrap_err(), Error::NotOpen);
    assert_eq!(env.stat().unwrap_err(), Error::NotOpen);
}

#[test]
fn no_sub_dir_opens_a_file_path() {
    let dir = tempdir().unwrap();
    let env = Environment::new();
    env.set_map_size(1 << 24).unwrap();
    env.open_with(&dir.path().join("data.mdb"), EnvironmentFlags::NO_SUB_DIR, 0o644)
        .unwrap();
    assert!(env.is_open());
    assert!(dir.path().join("data.mdb").exists());
}

#[test]
fn close_cascades_to_transactions_and_databases() {
    let (_dir, env) = open_env(1);

    let schema = env.begin_schema_txn().unwrap();
    let db = schema.open_database(Some("a"), &DatabaseConfig::default()).unwrap();
    schema.commit().unwrap();

    let txn = env.begin_rw_txn().unwrap();
    let cursor = db.cursor(&txn).unwrap();

    env.close();
    env.close(); // idempotent

    assert_eq!(cursor.first::<Vec<u8>, Vec<u8>>().unwrap_err(), Error::Closed);
    assert_eq!(txn.commit().unwrap_err(), Error::Closed);

    let txn2 = env.begin_rw_txn();
    assert_eq!(txn2.unwrap_err(), Error::Closed);
}

#[test]
fn finished_transaction_invalidates_its_cursors() {
    let (_dir, env) = open_env(1);
    let schema = env.begin_schema_txn().unwrap();
    let db = schema.open_database(Some("a"), &DatabaseConfig::default()).unwrap();
    schema.commit().unwrap();

    let txn = env.begin_rw_txn().unwrap();
    db.put(&txn, b"k", b"v", WriteFlags::empty()).unwrap();
    let cursor = db.cursor(&txn).unwrap();
    assert!(cursor.first::<Vec<u8>, Vec<u8>>().unwrap().is_some());

    txn.commit().unwrap();
    assert_eq!(cursor.first::<Vec<u8>, Vec<u8>>().unwrap_err(), Error::Closed);
}

#[test]
fn schema_transactions_are_exclusive() {
    let (_dir, env) = open_env(2);

    let first = env.begin_schema_txn().unwrap();
    assert_eq!(env.begin_schema_txn().unwrap_err(), Error::SchemaTransactionActive);

    drop(first);
    let second = env.begin_schema_txn().unwrap();
    second.commit().unwrap();
}

#[test]
fn duplicate_names_are_rejected_case_insensitively() {
    let (_dir, env) = open_env(2);

    let schema = env.begin_schema_txn().unwrap();
    schema.open_database(Some("meta"), &DatabaseConfig::default()).unwrap();
    assert_eq!(
        schema.open_database(Some("META"), &DatabaseConfig::default()).unwrap_err(),
        Error::DuplicateName("META".to_owned())
    );
    schema.commit().unwrap();

    let schema = env.begin_schema_txn().unwrap();
    assert_eq!(
        schema.open_database(Some("Meta"), &DatabaseConfig::default()).unwrap_err(),
        Error::DuplicateName("Meta".to_owned())
    );
}

#[test]
fn provisional_databases_publish_only_on_commit() {
    let (_dir, env) = open_env(2);

    let schema = env.begin_schema_txn().unwrap();
    let db = schema.open_database(Some("pending"), &DatabaseConfig::default()).unwrap();
    // Seed atomically with the creation.
    db.put(&schema, b"seed", b"1", WriteFlags::empty()).unwrap();

    assert_eq!(
        env.database(Some("pending")).unwrap_err(),
        Error::DatabaseNotFound("pending".to_owned())
    );

    schema.commit().unwrap();
    let published = env.database(Some("pending")).unwrap();
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(published.get::<_, Vec<u8>>(&txn, b"seed").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn aborted_schema_invalidates_its_handles() {
    let (_dir, env) = open_env(2);

    let schema = env.begin_schema_txn().unwrap();
    let db = schema.open_database(Some("ghost"), &DatabaseConfig::default()).unwrap();
    schema.abort();

    assert!(env.database(Some("ghost")).is_err());
    let txn = env.begin_rw_txn().unwrap();
    assert_eq!(db.put(&txn, b"k", b"v", WriteFlags::empty()).unwrap_err(), Error::Closed);
    txn.abort();

    // The slot is free again.
    let schema = env.begin_schema_txn().unwrap();
    schema.open_database(Some("ghost"), &DatabaseConfig::default()).unwrap();
    schema.commit().unwrap();
}

#[test]
fn nested_transactions_fold_into_the_parent() {
    let (_dir, env) = open_env(1);
    let schema = env.begin_schema_txn().unwrap();
    let db = schema.open_database(Some("a"), &DatabaseConfig::default()).unwrap();
    schema.commit().unwrap();

    let parent = env.begin_rw_txn().unwrap();
    db.put(&parent, b"outer", b"1", WriteFlags::empty()).unwrap();

    let child = parent.begin_nested().unwrap();
    db.put(&child, b"inner", b"2", WriteFlags::empty()).unwrap();
    child.commit().unwrap();

    let child = parent.begin_nested().unwrap();
    db.put(&child, b"discarded", b"3", WriteFlags::empty()).unwrap();
    child.abort();

    parent.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert!(db.get::<_, Vec<u8>>(&txn, b"outer").unwrap().is_some());
    assert!(db.get::<_, Vec<u8>>(&txn, b"inner").unwrap().is_some());
    assert!(db.get::<_, Vec<u8>>(&txn, b"discarded").unwrap().is_none());
}

#[test]
fn aborting_a_parent_disarms_its_live_children() {
    let (_dir, env) = open_env(1);
    let schema = env.begin_schema_txn().unwrap();
    let db = schema.open_database(Some("a"), &DatabaseConfig::default()).unwrap();
    schema.commit().unwrap();

    let parent = env.begin_rw_txn().unwrap();
    let child = parent.begin_nested().unwrap();
    db.put(&child, b"k", b"v", WriteFlags::empty()).unwrap();

    // The engine frees the child together with the parent; the child handle
    // must notice rather than touch the freed transaction on drop.
    parent.abort();
    assert_eq!(child.id().unwrap_err(), Error::Closed);
    assert_eq!(
        db.put(&child, b"k2", b"v2", WriteFlags::empty()).unwrap_err(),
        Error::Closed
    );
    drop(child);

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get::<_, Vec<u8>>(&txn, b"k").unwrap(), None);
}

#[test]
fn committing_a_parent_carries_its_live_children() {
    let (_dir, env) = open_env(1);
    let schema = env.begin_schema_txn().unwrap();
    let db = schema.open_database(Some("a"), &DatabaseConfig::default()).unwrap();
    schema.commit().unwrap();

    let parent = env.begin_rw_txn().unwrap();
    let child = parent.begin_nested().unwrap();
    let grandchild = child.begin_nested().unwrap();
    db.put(&grandchild, b"k", b"v", WriteFlags::empty()).unwrap();

    // The engine commits the whole chain with the parent; the wrapper
    // handles all flip to closed.
    parent.commit().unwrap();
    assert_eq!(grandchild.id().unwrap_err(), Error::Closed);
    assert_eq!(child.commit().unwrap_err(), Error::Closed);

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get::<_, Vec<u8>>(&txn, b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn close_cascade_reaches_nested_transactions() {
    let (_dir, env) = open_env(1);
    let parent = env.begin_rw_txn().unwrap();
    let child = parent.begin_nested().unwrap();

    env.close();
    assert_eq!(child.id().unwrap_err(), Error::Closed);
    assert_eq!(parent.id().unwrap_err(), Error::Closed);
    drop(child);
    drop(parent);
}

#[test]
fn readers_reset_and_renew() {
    let (_dir, env) = open_env(1);
    let schema = env.begin_schema_txn().unwrap();
    let db = schema.open_database(Some("a"), &DatabaseConfig::default()).unwrap();
    schema.commit().unwrap();

    let rw = env.begin_rw_txn().unwrap();
    db.put(&rw, b"k", b"old", WriteFlags::empty()).unwrap();
    rw.commit().unwrap();

    let ro = env.begin_ro_txn().unwrap();
    assert_eq!(db.get::<_, Vec<u8>>(&ro, b"k").unwrap(), Some(b"old".to_vec()));

    ro.reset().unwrap();

    let rw = env.begin_rw_txn().unwrap();
    db.put(&rw, b"k", b"new", WriteFlags::empty()).unwrap();
    rw.commit().unwrap();

    ro.renew().unwrap();
    assert_eq!(db.get::<_, Vec<u8>>(&ro, b"k").unwrap(), Some(b"new".to_vec()));
}

#[test]
fn no_tls_allows_many_readers_per_thread() {
    let dir = tempdir().unwrap();
    let env = Environment::new();
    env.set_map_size(1 << 24).unwrap();
    env.open_with(dir.path(), EnvironmentFlags::NO_TLS, 0o644).unwrap();

    let first = env.begin_ro_txn().unwrap();
    let second = env.begin_ro_txn().unwrap();
    assert!(first.id().is_ok());
    assert!(second.id().is_ok());
}

#[test]
fn environment_stat_and_info_report() {
    let (_dir, env) = open_env(1);
    let stat = env.stat().unwrap();
    assert!(stat.page_size() > 0);

    let info = env.info().unwrap();
    assert_eq!(info.map_size(), 1 << 24);

    env.sync(true).unwrap();
}
