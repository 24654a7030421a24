//! DB iterator semantics: merged layers, bounds, prefix constraint,
//! seek_for_prev, and direction changes.

use std::sync::Arc;

use tempfile::TempDir;

use crate::config::{PrefixExtractor, ReadOptions};
use crate::engine::tests::helpers::*;

fn populate_three_layers(db: &crate::engine::Db) {
    // Layer 1: flushed table.
    db.put(b"a", b"from-sst").unwrap();
    db.put(b"c", b"from-sst").unwrap();
    db.put(b"e", b"from-sst").unwrap();
    db.flush().unwrap();

    // Layer 2: another table overwriting one key.
    db.put(b"c", b"from-sst2").unwrap();
    db.put(b"g", b"from-sst2").unwrap();
    db.flush().unwrap();

    // Layer 3: memtable.
    db.put(b"b", b"from-mem").unwrap();
    db.put(b"e", b"from-mem").unwrap();
}

#[test]
fn merged_iteration_prefers_newest_version() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), manual_options());
    populate_three_layers(&db);

    assert_eq!(
        collect_all(&db),
        vec![
            (b"a".to_vec(), b"from-sst".to_vec()),
            (b"b".to_vec(), b"from-mem".to_vec()),
            (b"c".to_vec(), b"from-sst2".to_vec()),
            (b"e".to_vec(), b"from-mem".to_vec()),
            (b"g".to_vec(), b"from-sst2".to_vec()),
        ]
    );
    db.close().unwrap();
}

#[test]
fn seek_positions_at_first_key_at_or_after() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), manual_options());
    populate_three_layers(&db);

    let mut iter = db.iter(&ReadOptions::default()).unwrap();

    iter.seek(b"c");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"c");

    iter.seek(b"d");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"e");

    iter.seek(b"z");
    assert!(!iter.valid());
    db.close().unwrap();
}

#[test]
fn seek_for_prev_returns_largest_key_at_or_below() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), manual_options());
    populate_three_layers(&db);

    let mut iter = db.iter(&ReadOptions::default()).unwrap();

    iter.seek_for_prev(b"c");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"c");

    iter.seek_for_prev(b"d");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"c");

    iter.seek_for_prev(b"0");
    assert!(!iter.valid());

    iter.seek_for_prev(b"z");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"g");
    db.close().unwrap();
}

#[test]
fn direction_changes_re_seek_correctly() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), manual_options());
    populate_three_layers(&db);

    let mut iter = db.iter(&ReadOptions::default()).unwrap();
    iter.seek(b"c");
    assert_eq!(iter.key(), b"c");

    iter.next();
    assert_eq!(iter.key(), b"e");

    iter.prev();
    assert_eq!(iter.key(), b"c");

    iter.prev();
    assert_eq!(iter.key(), b"b");

    iter.next();
    assert_eq!(iter.key(), b"c");
    db.close().unwrap();
}

#[test]
fn backward_walk_from_the_end() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), manual_options());
    populate_three_layers(&db);

    let mut iter = db.iter(&ReadOptions::default()).unwrap();
    iter.seek_to_last();

    let mut keys = Vec::new();
    while iter.valid() {
        keys.push(iter.key().to_vec());
        iter.prev();
    }
    assert_eq!(
        keys,
        vec![
            b"g".to_vec(),
            b"e".to_vec(),
            b"c".to_vec(),
            b"b".to_vec(),
            b"a".to_vec(),
        ]
    );
    db.close().unwrap();
}

#[test]
fn deleted_keys_are_skipped_in_both_directions() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), manual_options());

    db.put(b"a", b"1").unwrap();
    db.put(b"b", b"2").unwrap();
    db.put(b"c", b"3").unwrap();
    db.flush().unwrap();
    db.delete(b"b").unwrap();

    assert_eq!(
        collect_keys(&db),
        vec![b"a".to_vec(), b"c".to_vec()]
    );

    let mut iter = db.iter(&ReadOptions::default()).unwrap();
    iter.seek_to_last();
    assert_eq!(iter.key(), b"c");
    iter.prev();
    assert_eq!(iter.key(), b"a", "deleted b skipped walking backward");
    db.close().unwrap();
}

#[test]
fn bounds_clip_iteration() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), memtable_only_options());

    for key in ["a", "b", "c", "d", "e"] {
        db.put(key, b"v").unwrap();
    }

    let opts = ReadOptions {
        lower_bound: Some(b"b".to_vec()),
        upper_bound: Some(b"e".to_vec()),
        ..ReadOptions::default()
    };

    let keys: Vec<Vec<u8>> = collect_with(&db, &opts)
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

    // Seeking below the lower bound clamps to it.
    let mut iter = db.iter(&opts).unwrap();
    iter.seek(b"a");
    assert_eq!(iter.key(), b"b");

    // seek_to_last honors the exclusive upper bound.
    let mut iter = db.iter(&opts).unwrap();
    iter.seek_to_last();
    assert_eq!(iter.key(), b"d");
    db.close().unwrap();
}

#[test]
fn prefix_constraint_stops_at_prefix_change() {
    struct FirstByte;
    impl PrefixExtractor for FirstByte {
        fn name(&self) -> &str {
            "test.FirstByte"
        }
        fn prefix<'k>(&self, key: &'k [u8]) -> &'k [u8] {
            &key[..key.len().min(1)]
        }
    }

    let tmp = TempDir::new().unwrap();
    let mut options = memtable_only_options();
    options.prefix_extractor = Some(Arc::new(FirstByte));
    let db = open_db(tmp.path(), options);

    for key in ["a1", "a2", "a3", "b1", "b2"] {
        db.put(key, b"v").unwrap();
    }

    let opts = ReadOptions {
        prefix_same_as_start: true,
        ..ReadOptions::default()
    };
    let mut iter = db.iter(&opts).unwrap();
    iter.seek(b"a1");

    let mut keys = Vec::new();
    while iter.valid() {
        keys.push(iter.key().to_vec());
        iter.next();
    }
    assert_eq!(
        keys,
        vec![b"a1".to_vec(), b"a2".to_vec(), b"a3".to_vec()],
        "iteration must stop when the prefix changes"
    );
    db.close().unwrap();
}

#[test]
fn iterator_unaffected_by_concurrent_writes() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), memtable_only_options());

    db.put(b"a", b"1").unwrap();
    db.put(b"b", b"2").unwrap();

    let mut iter = db.iter(&ReadOptions::default()).unwrap();
    iter.seek_to_first();

    // Writes after iterator creation are invisible to it.
    db.put(b"c", b"3").unwrap();
    db.delete(b"b").unwrap();

    let mut keys = Vec::new();
    while iter.valid() {
        keys.push(iter.key().to_vec());
        iter.next();
    }
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    db.close().unwrap();
}

#[test]
fn returned_slices_are_stable_copies() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), memtable_only_options());

    db.put(b"a", b"value-a").unwrap();
    db.put(b"b", b"value-b").unwrap();

    let mut iter = db.iter(&ReadOptions::default()).unwrap();
    iter.seek_to_first();
    let key_a = iter.key().to_vec();
    let value_a = iter.value().to_vec();
    iter.next();

    // Moving the cursor must not corrupt previously copied data, and
    // the current entry is independent of the previous one.
    assert_eq!(key_a, b"a");
    assert_eq!(value_a, b"value-a");
    assert_eq!(iter.key(), b"b");
    db.close().unwrap();
}
