//! Integration tests for the public `Db` API.
//!
//! These exercise the full storage stack (WAL → memtable → SSTable →
//! compaction) through the public `silexdb::{Db, DbOptions, ...}`
//! surface only. No internal modules are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: open, close, idempotent close, lock exclusion
//! - **CRUD**: put, get, delete, delete_range, overwrite
//! - **Batches**: atomic multi-record commits
//! - **Iteration**: full scans, bounded scans, backward scans
//! - **Persistence**: data and deletes survive close → reopen
//! - **Concurrency**: multi-thread writers and readers
//! - **Snapshots**: isolation through the public handle

use std::collections::BTreeMap;
use std::thread;

use tempfile::TempDir;

use silexdb::{Db, DbOptions, ReadOptions, WriteBatch, WriteOptions};

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn options() -> DbOptions {
    DbOptions {
        create_if_missing: true,
        ..DbOptions::default()
    }
}

fn open(path: &std::path::Path) -> Db {
    Db::open(path, options()).expect("open")
}

fn scan_all(db: &Db) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut iter = db.iter(&ReadOptions::default()).expect("iter");
    let mut out = Vec::new();
    iter.seek_to_first();
    while iter.valid() {
        out.push((iter.key().to_vec(), iter.value().to_vec()));
        iter.next();
    }
    out
}

// ------------------------------------------------------------------------------------------------
// Lifecycle
// ------------------------------------------------------------------------------------------------

#[test]
fn open_close_reopen_cycle() {
    let tmp = TempDir::new().unwrap();

    let db = open(tmp.path());
    db.put(b"k", b"v").unwrap();
    db.close().unwrap();
    // Close is idempotent.
    db.close().unwrap();
    drop(db);

    let db = open(tmp.path());
    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    db.close().unwrap();
}

#[test]
fn clones_share_one_engine() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());
    let alias = db.clone();

    db.put(b"k", b"v").unwrap();
    assert_eq!(alias.get(b"k").unwrap(), Some(b"v".to_vec()));
    alias.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// CRUD through the public surface
// ------------------------------------------------------------------------------------------------

#[test]
fn crud_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    for i in 0..100u64 {
        db.put(format!("key-{i:03}"), format!("value-{i:03}")).unwrap();
    }
    for i in (0..100u64).step_by(3) {
        db.delete(format!("key-{i:03}")).unwrap();
    }
    db.delete_range(b"key-050", b"key-060").unwrap();

    for i in 0..100u64 {
        let got = db.get(format!("key-{i:03}")).unwrap();
        let deleted = i % 3 == 0 || (50..60).contains(&i);
        if deleted {
            assert_eq!(got, None, "key-{i:03}");
        } else {
            assert_eq!(got, Some(format!("value-{i:03}").into_bytes()), "key-{i:03}");
        }
    }
    db.close().unwrap();
}

#[test]
fn batch_commit_is_atomic_and_ordered() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    let mut batch = WriteBatch::new();
    batch.put(b"a", b"1");
    batch.put(b"b", b"2");
    batch.delete(b"a");
    db.write(&WriteOptions::default(), batch).unwrap();

    assert_eq!(db.get(b"a").unwrap(), None);
    assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Iteration
// ------------------------------------------------------------------------------------------------

#[test]
fn scans_agree_with_a_model_map() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    for i in 0..200u64 {
        let key = format!("key-{:04}", (i * 37) % 500).into_bytes();
        let value = format!("value-{i}").into_bytes();
        db.put(&key, &value).unwrap();
        model.insert(key, value);
    }
    for i in 0..50u64 {
        let key = format!("key-{:04}", (i * 53) % 500).into_bytes();
        db.delete(&key).unwrap();
        model.remove(&key);
    }

    let scanned = scan_all(&db);
    let expected: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
    assert_eq!(scanned, expected);
    db.close().unwrap();
}

#[test]
fn bounded_backward_scan() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    for key in ["a", "b", "c", "d", "e", "f"] {
        db.put(key, b"v").unwrap();
    }

    let opts = ReadOptions {
        lower_bound: Some(b"b".to_vec()),
        upper_bound: Some(b"e".to_vec()),
        ..ReadOptions::default()
    };
    let mut iter = db.iter(&opts).unwrap();
    iter.seek_to_last();

    let mut keys = Vec::new();
    while iter.valid() {
        keys.push(iter.key().to_vec());
        iter.prev();
    }
    assert_eq!(keys, vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec()]);
    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Persistence
// ------------------------------------------------------------------------------------------------

#[test]
fn deletes_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let db = open(tmp.path());
        db.put(b"keep", b"v").unwrap();
        db.put(b"drop", b"v").unwrap();
        db.delete(b"drop").unwrap();
        db.close().unwrap();
    }

    let db = open(tmp.path());
    assert_eq!(db.get(b"keep").unwrap(), Some(b"v".to_vec()));
    assert_eq!(db.get(b"drop").unwrap(), None);
    db.close().unwrap();
}

#[test]
fn flush_and_compact_preserve_the_visible_state() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    for i in 0..50u64 {
        db.put(format!("key-{i:02}"), format!("value-{i:02}")).unwrap();
    }
    db.delete_range(b"key-10", b"key-20").unwrap();

    let before = scan_all(&db);
    db.flush().unwrap();
    assert_eq!(scan_all(&db), before, "flush changed visible state");

    db.compact_range(None, None).unwrap();
    assert_eq!(scan_all(&db), before, "compaction changed visible state");
    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Concurrency
// ------------------------------------------------------------------------------------------------

#[test]
fn concurrent_writers_each_land_their_keys() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    let mut handles = Vec::new();
    for worker in 0..4u64 {
        let db = db.clone();
        handles.push(thread::spawn(move || {
            for i in 0..100u64 {
                db.put(format!("w{worker}-key-{i:03}"), format!("w{worker}-v{i}"))
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for worker in 0..4u64 {
        for i in 0..100u64 {
            assert_eq!(
                db.get(format!("w{worker}-key-{i:03}")).unwrap(),
                Some(format!("w{worker}-v{i}").into_bytes())
            );
        }
    }
    db.close().unwrap();
}

#[test]
fn readers_run_during_writes() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());
    db.put(b"stable", b"anchor").unwrap();

    let writer = {
        let db = db.clone();
        thread::spawn(move || {
            for i in 0..300u64 {
                db.put(format!("churn-{i}"), b"v").unwrap();
            }
        })
    };

    for _ in 0..100 {
        assert_eq!(db.get(b"stable").unwrap(), Some(b"anchor".to_vec()));
    }
    writer.join().unwrap();
    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Snapshots
// ------------------------------------------------------------------------------------------------

#[test]
fn snapshot_isolation_through_public_api() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    db.put(b"k", b"v1").unwrap();
    let snap = db.snapshot().unwrap();
    db.put(b"k", b"v2").unwrap();

    let at_snap = ReadOptions {
        snapshot: Some(snap.sequence()),
        ..ReadOptions::default()
    };
    assert_eq!(db.get_with(&at_snap, b"k").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(db.get(b"k").unwrap(), Some(b"v2".to_vec()));

    db.release_snapshot(&snap);
    db.close().unwrap();
}
