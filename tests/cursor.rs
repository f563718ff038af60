//! Cursor positioning, duplicate-value verbs and the fixed-record bulk
//! verbs.

use byteorder::{BigEndian, ByteOrder};
use lmdb_ward::{
    DatabaseConfig, Environment, EnvironmentFlags, Error, FixedMultiDatabase, MultiDatabase,
    WriteFlags,
};
use tempfile::tempdir;

fn open_env() -> (tempfile::TempDir, Environment) {
    let dir = tempdir().unwrap();
    let env = Environment::new();
    env.set_map_size(1 << 24).unwrap();
    env.set_max_dbs(4).unwrap();
    env.open(dir.path()).unwrap();
    (dir, env)
}

fn open_multi(env: &Environment, name: &str) -> MultiDatabase {
    let schema = env.begin_schema_txn().unwrap();
    let db = schema.open_multi_database(Some(name), &DatabaseConfig::default()).unwrap();
    schema.commit().unwrap();
    db
}

fn open_fixed(env: &Environment, name: &str, record_size: usize) -> FixedMultiDatabase {
    let schema = env.begin_schema_txn().unwrap();
    let db = schema
        .open_fixed_multi_database(Some(name), &DatabaseConfig::default(), record_size)
        .unwrap();
    schema.commit().unwrap();
    db
}

type Pair = (Vec<u8>, Vec<u8>);

fn pair(key: &[u8], value: &[u8]) -> Pair {
    (key.to_vec(), value.to_vec())
}

#[test]
fn positioning_verbs() {
    let (_dir, env) = open_env();
    let schema = env.begin_schema_txn().unwrap();
    let db = schema.open_database(Some("kv"), &DatabaseConfig::default()).unwrap();
    schema.commit().unwrap();

    let txn = env.begin_rw_txn().unwrap();
    for (k, v) in [(b"a", b"1"), (b"c", b"3"), (b"e", b"5")] {
        db.put(&txn, k, v, WriteFlags::empty()).unwrap();
    }
    let cursor = db.cursor(&txn).unwrap();

    assert_eq!(cursor.first::<Vec<u8>, Vec<u8>>().unwrap(), Some(pair(b"a", b"1")));
    assert_eq!(cursor.next::<Vec<u8>, Vec<u8>>().unwrap(), Some(pair(b"c", b"3")));
    assert_eq!(cursor.get_current::<Vec<u8>, Vec<u8>>().unwrap(), Some(pair(b"c", b"3")));
    assert_eq!(cursor.prev::<Vec<u8>, Vec<u8>>().unwrap(), Some(pair(b"a", b"1")));
    assert_eq!(cursor.prev::<Vec<u8>, Vec<u8>>().unwrap(), None);
    assert_eq!(cursor.last::<Vec<u8>, Vec<u8>>().unwrap(), Some(pair(b"e", b"5")));
    assert_eq!(cursor.next::<Vec<u8>, Vec<u8>>().unwrap(), None);

    assert_eq!(cursor.set::<Vec<u8>>(b"c").unwrap(), Some(b"3".to_vec()));
    assert_eq!(cursor.set::<Vec<u8>>(b"b").unwrap(), None);
    assert_eq!(cursor.set_key::<Vec<u8>, Vec<u8>>(b"e").unwrap(), Some(pair(b"e", b"5")));
    assert_eq!(cursor.set_range::<Vec<u8>, Vec<u8>>(b"b").unwrap(), Some(pair(b"c", b"3")));
    assert_eq!(cursor.set_range::<Vec<u8>, Vec<u8>>(b"f").unwrap(), None);
}

#[test]
fn get_current_requires_a_position() {
    let (_dir, env) = open_env();
    let schema = env.begin_schema_txn().unwrap();
    let db = schema.open_database(Some("kv"), &DatabaseConfig::default()).unwrap();
    schema.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let cursor = db.cursor(&txn).unwrap();
    assert_eq!(
        cursor.get_current::<Vec<u8>, Vec<u8>>().unwrap_err(),
        Error::InvalidPosition
    );
}

#[test]
fn iterators_are_lazy_and_fused() {
    let (_dir, env) = open_env();
    let schema = env.begin_schema_txn().unwrap();
    let db = schema.open_database(Some("kv"), &DatabaseConfig::default()).unwrap();
    schema.commit().unwrap();

    let txn = env.begin_rw_txn().unwrap();
    for (k, v) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3")] {
        db.put(&txn, k, v, WriteFlags::empty()).unwrap();
    }
    let mut cursor = db.cursor(&txn).unwrap();

    let all: Vec<Pair> = cursor.iter_start().map(Result::unwrap).collect();
    assert_eq!(all, vec![pair(b"a", b"1"), pair(b"b", b"2"), pair(b"c", b"3")]);

    let reversed: Vec<Pair> = cursor.iter_end().map(Result::unwrap).collect();
    assert_eq!(reversed, vec![pair(b"c", b"3"), pair(b"b", b"2"), pair(b"a", b"1")]);

    let tail: Vec<Pair> = cursor.iter_from(b"b").map(Result::unwrap).collect();
    assert_eq!(tail, vec![pair(b"b", b"2"), pair(b"c", b"3")]);

    let empty: Vec<Pair> = cursor.iter_from(b"z").map(Result::unwrap).collect();
    assert!(empty.is_empty());

    // `iter` resumes after the current position.
    cursor.set::<()>(b"a").unwrap();
    let rest: Vec<Pair> = cursor.iter().map(Result::unwrap).collect();
    assert_eq!(rest, vec![pair(b"b", b"2"), pair(b"c", b"3")]);

    let mut exhausted = cursor.iter_start::<Vec<u8>, Vec<u8>>();
    while exhausted.next().is_some() {}
    assert!(exhausted.next().is_none());
}

#[test]
fn duplicate_verbs() {
    let (_dir, env) = open_env();
    let db = open_multi(&env, "dups");

    let txn = env.begin_rw_txn().unwrap();
    for (k, v) in [(b"a", b"1"), (b"a", b"2"), (b"a", b"3"), (b"b", b"9")] {
        db.put(&txn, k, v, WriteFlags::empty()).unwrap();
    }
    let cursor = db.cursor(&txn).unwrap();

    assert_eq!(cursor.set::<Vec<u8>>(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(cursor.count().unwrap(), 3);
    assert_eq!(cursor.last_dup::<Vec<u8>>().unwrap(), Some(b"3".to_vec()));
    assert_eq!(cursor.first_dup::<Vec<u8>>().unwrap(), Some(b"1".to_vec()));
    assert_eq!(
        cursor.next_dup::<Vec<u8>, Vec<u8>>().unwrap(),
        Some(pair(b"a", b"2"))
    );
    assert_eq!(
        cursor.prev_dup::<Vec<u8>, Vec<u8>>().unwrap(),
        Some(pair(b"a", b"1"))
    );
    assert_eq!(
        cursor.next_nodup::<Vec<u8>, Vec<u8>>().unwrap(),
        Some(pair(b"b", b"9"))
    );
    assert_eq!(
        cursor.prev_nodup::<Vec<u8>, Vec<u8>>().unwrap(),
        Some(pair(b"a", b"3"))
    );

    assert_eq!(cursor.get_both::<Vec<u8>>(b"a", b"2").unwrap(), Some(b"2".to_vec()));
    assert_eq!(cursor.get_both::<Vec<u8>>(b"a", b"4").unwrap(), None);
    assert_eq!(
        cursor.get_both_range::<Vec<u8>>(b"a", b"15").unwrap(),
        Some(b"2".to_vec())
    );
}

#[test]
fn count_requires_a_position() {
    let (_dir, env) = open_env();
    let db = open_multi(&env, "dups");

    let txn = env.begin_ro_txn().unwrap();
    let cursor = db.cursor(&txn).unwrap();
    assert_eq!(cursor.count().unwrap_err(), Error::InvalidPosition);
}

#[test]
fn no_dup_data_put_reports_false() {
    let (_dir, env) = open_env();
    let db = open_multi(&env, "dups");

    let txn = env.begin_rw_txn().unwrap();
    let cursor = db.cursor(&txn).unwrap();
    assert!(cursor.put(b"a", b"1", WriteFlags::empty()).unwrap());
    assert!(!cursor.put(b"a", b"1", WriteFlags::NO_DUP_DATA).unwrap());
    assert!(cursor.put(b"a", b"2", WriteFlags::NO_DUP_DATA).unwrap());
    cursor.set::<()>(b"a").unwrap();
    assert_eq!(cursor.count().unwrap(), 2);
}

#[test]
fn dup_iterators_and_deletes() {
    let (_dir, env) = open_env();
    let db = open_multi(&env, "dups");

    let txn = env.begin_rw_txn().unwrap();
    for (k, v) in [(b"a", b"1"), (b"a", b"2"), (b"b", b"8"), (b"b", b"9"), (b"c", b"0")] {
        db.put(&txn, k, v, WriteFlags::empty()).unwrap();
    }
    let mut cursor = db.cursor(&txn).unwrap();

    let dups: Vec<Vec<u8>> = cursor.iter_dups_of(b"b").map(Result::unwrap).collect();
    assert_eq!(dups, vec![b"8".to_vec(), b"9".to_vec()]);

    let reversed: Vec<Vec<u8>> =
        cursor.iter_dups_of_reverse(b"b").map(Result::unwrap).collect();
    assert_eq!(reversed, vec![b"9".to_vec(), b"8".to_vec()]);

    let none: Vec<Vec<u8>> = cursor.iter_dups_of(b"x").map(Result::unwrap).collect();
    assert!(none.is_empty());

    let keys: Vec<Vec<u8>> = cursor.iter_keys_start().map(Result::unwrap).collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

    let everything: Vec<Pair> = cursor.iter_dups().map(Result::unwrap).collect();
    assert_eq!(everything.len(), 5);

    // Deleting one duplicate leaves the rest.
    cursor.get_both::<()>(b"a", b"1").unwrap();
    cursor.del(WriteFlags::empty()).unwrap();
    cursor.set::<()>(b"a").unwrap();
    assert_eq!(cursor.count().unwrap(), 1);

    // NO_DUP_DATA at the cursor removes the whole key.
    cursor.set::<()>(b"b").unwrap();
    cursor.del(WriteFlags::NO_DUP_DATA).unwrap();
    assert_eq!(db.get::<_, Vec<u8>>(&txn, b"b").unwrap(), None);
}

#[test]
fn fixed_records_bulk_put_and_get() {
    let (_dir, env) = open_env();
    let db = open_fixed(&env, "fixed", 16);

    let txn = env.begin_rw_txn().unwrap();
    let cursor = db.cursor(&txn).unwrap();

    // Three 16-byte records in one contiguous buffer.
    let mut records = [0u8; 48];
    for (i, chunk) in records.chunks_exact_mut(16).enumerate() {
        BigEndian::write_u64(&mut chunk[..8], i as u64 + 1);
        BigEndian::write_u64(&mut chunk[8..], 0xfeed);
    }
    let written = cursor.put_multiple(b"k", &records, 3, WriteFlags::empty()).unwrap();
    assert_eq!(written, 3);

    let chunk: Vec<[u8; 16]> = cursor.get_multiple(b"k").unwrap().unwrap();
    assert_eq!(chunk.len(), 3);
    assert_eq!(BigEndian::read_u64(&chunk[0][..8]), 1);
    assert_eq!(BigEndian::read_u64(&chunk[2][..8]), 3);

    // A page holds all three, so the next batch is empty.
    assert_eq!(cursor.next_multiple::<[u8; 16]>().unwrap(), None);
    assert_eq!(cursor.get_multiple::<[u8; 16]>(b"missing").unwrap(), None);
}

#[test]
fn bulk_put_checks_the_buffer_bounds() {
    let (_dir, env) = open_env();
    let db = open_fixed(&env, "fixed", 16);

    let txn = env.begin_rw_txn().unwrap();
    let cursor = db.cursor(&txn).unwrap();

    let records = [0u8; 32];
    assert_eq!(
        cursor.put_multiple(b"k", &records, 3, WriteFlags::empty()).unwrap_err(),
        Error::TooManyFixedItems { requested: 3, record_size: 16, available: 32 }
    );
}

#[test]
fn fixed_record_batches_iterate() {
    let (_dir, env) = open_env();
    let db = open_fixed(&env, "fixed", 8);

    let txn = env.begin_rw_txn().unwrap();
    let cursor = db.cursor(&txn).unwrap();

    let mut records = vec![0u8; 8 * 100];
    for (i, chunk) in records.chunks_exact_mut(8).enumerate() {
        BigEndian::write_u64(chunk, i as u64);
    }
    assert_eq!(
        cursor.put_multiple(b"k", &records, 100, WriteFlags::empty()).unwrap(),
        100
    );

    let mut cursor = db.cursor(&txn).unwrap();
    let mut seen = 0usize;
    for batch in cursor.iter_multiple::<[u8; 8]>(b"k") {
        for record in batch.unwrap() {
            assert_eq!(BigEndian::read_u64(&record), seen as u64);
            seen += 1;
        }
    }
    assert_eq!(seen, 100);
}

#[test]
fn reader_cursors_renew_across_transactions() {
    // Two live readers on one thread require NO_TLS reader slots.
    let _dir = tempdir().unwrap();
    let env = Environment::new();
    env.set_map_size(1 << 24).unwrap();
    env.set_max_dbs(4).unwrap();
    env.open_with(_dir.path(), EnvironmentFlags::NO_TLS, 0o644).unwrap();
    let schema = env.begin_schema_txn().unwrap();
    let db = schema.open_database(Some("kv"), &DatabaseConfig::default()).unwrap();
    schema.commit().unwrap();

    let rw = env.begin_rw_txn().unwrap();
    db.put(&rw, b"k", b"v", WriteFlags::empty()).unwrap();
    rw.commit().unwrap();

    let ro = env.begin_ro_txn().unwrap();
    let mut cursor = db.cursor(&ro).unwrap();
    assert!(cursor.first::<Vec<u8>, Vec<u8>>().unwrap().is_some());

    // Rebind to the same reader after a reset/renew round.
    ro.reset().unwrap();
    ro.renew().unwrap();
    cursor.renew(&ro).unwrap();
    assert!(cursor.first::<Vec<u8>, Vec<u8>>().unwrap().is_some());

    // Rebind to a different reader; ownership moves with it, so the old
    // transaction can finish without taking the cursor down.
    let fresh = env.begin_ro_txn().unwrap();
    cursor.renew(&fresh).unwrap();
    drop(ro);
    assert!(cursor.first::<Vec<u8>, Vec<u8>>().unwrap().is_some());
}
