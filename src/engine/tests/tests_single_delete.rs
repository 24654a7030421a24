//! SingleDelete contract: removal of exactly one put, type
//! preservation end to end, and compaction pairing.

use tempfile::TempDir;

use crate::batch::{BatchError, BatchHandler, WriteBatch};
use crate::config::WriteOptions;
use crate::engine::tests::helpers::*;

#[test]
fn single_delete_hides_the_put() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), memtable_only_options());

    let mut batch = WriteBatch::new();
    batch.put(b"x", b"v1");
    batch.single_delete(b"x");
    db.write(&WriteOptions::default(), batch).unwrap();

    assert_eq!(db.get(b"x").unwrap(), None);
    db.close().unwrap();
}

#[test]
fn single_delete_via_helper_api() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), memtable_only_options());

    db.put(b"x", b"v1").unwrap();
    db.single_delete(b"x").unwrap();
    assert_eq!(db.get(b"x").unwrap(), None);
    db.close().unwrap();
}

#[test]
fn rebuilt_batch_reports_single_delete_not_delete() {
    // A batch that round-trips through raw bytes (the savepoint /
    // rollback path) must iterate as single_delete.
    let mut batch = WriteBatch::new();
    batch.put(b"x", b"v1");
    batch.single_delete(b"x");

    let rebuilt = WriteBatch::from_raw(batch.into_bytes()).unwrap();

    #[derive(Default)]
    struct KindWatcher {
        single_deletes: usize,
        deletes: usize,
    }
    impl BatchHandler for KindWatcher {
        fn put(&mut self, _cf: u32, _k: &[u8], _v: &[u8]) -> Result<(), BatchError> {
            Ok(())
        }
        fn delete(&mut self, _cf: u32, _k: &[u8]) -> Result<(), BatchError> {
            self.deletes += 1;
            Ok(())
        }
        fn single_delete(&mut self, _cf: u32, _k: &[u8]) -> Result<(), BatchError> {
            self.single_deletes += 1;
            Ok(())
        }
        fn merge(&mut self, _cf: u32, _k: &[u8], _v: &[u8]) -> Result<(), BatchError> {
            Ok(())
        }
        fn delete_range(&mut self, _cf: u32, _s: &[u8], _e: &[u8]) -> Result<(), BatchError> {
            Ok(())
        }
    }

    let mut watcher = KindWatcher::default();
    rebuilt.iterate(&mut watcher).unwrap();
    assert_eq!(watcher.single_deletes, 1);
    assert_eq!(watcher.deletes, 0, "no silent Delete substitution");
}

#[test]
fn single_delete_survives_flush() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), manual_options());

    db.put(b"x", b"v1").unwrap();
    db.flush().unwrap();
    db.single_delete(b"x").unwrap();
    db.flush().unwrap();

    assert_eq!(db.get(b"x").unwrap(), None);

    let db = reopen(db, tmp.path(), manual_options());
    assert_eq!(db.get(b"x").unwrap(), None);
    db.close().unwrap();
}

#[test]
fn compaction_pairs_single_delete_with_its_put() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), manual_options());

    db.put(b"x", b"v1").unwrap();
    db.put(b"keep", b"v").unwrap();
    db.flush().unwrap();
    db.single_delete(b"x").unwrap();
    db.flush().unwrap();

    db.compact_range(None, None).unwrap();

    assert_eq!(db.get(b"x").unwrap(), None);
    assert_eq!(db.get(b"keep").unwrap(), Some(b"v".to_vec()));
    assert_eq!(collect_keys(&db), vec![b"keep".to_vec()]);
    db.close().unwrap();
}
