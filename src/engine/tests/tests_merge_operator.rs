//! Merge operand behavior through the whole engine: reads, iterators,
//! flushes, and compaction folding.

use tempfile::TempDir;

use crate::engine::DbError;
use crate::engine::tests::helpers::*;

#[test]
fn merge_without_operator_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), memtable_only_options());
    let err = db.merge(b"k", b"+1").unwrap_err();
    assert!(matches!(err, DbError::MergeOperatorNotSet));
    db.close().unwrap();
}

#[test]
fn operands_fold_onto_a_base_put() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), merge_options());

    db.put(b"k", b"base").unwrap();
    db.merge(b"k", b"one").unwrap();
    db.merge(b"k", b"two").unwrap();

    assert_eq!(db.get(b"k").unwrap(), Some(b"base,one,two".to_vec()));
    db.close().unwrap();
}

#[test]
fn operands_without_base_fold_alone() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), merge_options());

    db.merge(b"k", b"one").unwrap();
    db.merge(b"k", b"two").unwrap();

    assert_eq!(db.get(b"k").unwrap(), Some(b"one,two".to_vec()));
    db.close().unwrap();
}

#[test]
fn delete_resets_the_merge_chain() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), merge_options());

    db.put(b"k", b"base").unwrap();
    db.merge(b"k", b"old").unwrap();
    db.delete(b"k").unwrap();
    db.merge(b"k", b"new").unwrap();

    assert_eq!(db.get(b"k").unwrap(), Some(b"new".to_vec()));
    db.close().unwrap();
}

#[test]
fn operands_fold_across_flushed_layers() {
    let tmp = TempDir::new().unwrap();
    let mut options = merge_options();
    options.disable_auto_compactions = true;
    let db = open_db(tmp.path(), options.clone());

    db.put(b"k", b"base").unwrap();
    db.flush().unwrap();
    db.merge(b"k", b"one").unwrap();
    db.flush().unwrap();
    db.merge(b"k", b"two").unwrap();

    assert_eq!(db.get(b"k").unwrap(), Some(b"base,one,two".to_vec()));

    // Same answer after reopen.
    let db = reopen(db, tmp.path(), options);
    assert_eq!(db.get(b"k").unwrap(), Some(b"base,one,two".to_vec()));
    db.close().unwrap();
}

#[test]
fn compaction_folds_operands_into_a_put() {
    let tmp = TempDir::new().unwrap();
    let mut options = merge_options();
    options.disable_auto_compactions = true;
    let db = open_db(tmp.path(), options);

    db.put(b"k", b"base").unwrap();
    db.flush().unwrap();
    db.merge(b"k", b"one").unwrap();
    db.merge(b"k", b"two").unwrap();
    db.flush().unwrap();

    db.compact_range(None, None).unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"base,one,two".to_vec()));
    db.close().unwrap();
}

#[test]
fn iterator_emits_folded_values() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), merge_options());

    db.put(b"a", b"plain").unwrap();
    db.put(b"m", b"base").unwrap();
    db.merge(b"m", b"x").unwrap();
    db.merge(b"z", b"lonely").unwrap();

    assert_eq!(
        collect_all(&db),
        vec![
            (b"a".to_vec(), b"plain".to_vec()),
            (b"m".to_vec(), b"base,x".to_vec()),
            (b"z".to_vec(), b"lonely".to_vec()),
        ]
    );
    db.close().unwrap();
}

#[test]
fn snapshot_sees_the_operand_prefix() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), merge_options());

    db.put(b"k", b"base").unwrap();
    db.merge(b"k", b"one").unwrap();
    let snap = db.snapshot().unwrap();
    db.merge(b"k", b"two").unwrap();

    let opts = crate::config::ReadOptions {
        snapshot: Some(snap.sequence()),
        ..Default::default()
    };
    assert_eq!(db.get_with(&opts, b"k").unwrap(), Some(b"base,one".to_vec()));
    assert_eq!(db.get(b"k").unwrap(), Some(b"base,one,two".to_vec()));

    db.release_snapshot(&snap);
    db.close().unwrap();
}
