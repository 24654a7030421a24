//! Shared helpers for engine tests: option presets, reopen cycles, and
//! iterator collection.

use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::{DbOptions, MergeOperator, ReadOptions};
use crate::engine::Db;

/// Initialize a tracing subscriber controlled by `RUST_LOG`.
/// Safe to call repeatedly — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Large write buffer: nothing flushes unless asked to.
pub fn memtable_only_options() -> DbOptions {
    init_tracing();
    DbOptions {
        create_if_missing: true,
        write_buffer_size: 64 * 1024 * 1024,
        ..DbOptions::default()
    }
}

/// Small write buffer so memtable switches happen quickly.
pub fn small_buffer_options() -> DbOptions {
    init_tracing();
    DbOptions {
        create_if_missing: true,
        write_buffer_size: 4 * 1024,
        level0_file_num_compaction_trigger: 4,
        ..DbOptions::default()
    }
}

/// Auto-compaction disabled; flushes are manual and L0 grows freely.
pub fn manual_options() -> DbOptions {
    init_tracing();
    DbOptions {
        create_if_missing: true,
        write_buffer_size: 64 * 1024 * 1024,
        disable_auto_compactions: true,
        ..DbOptions::default()
    }
}

/// Opens a database at `path`, creating it if needed.
pub fn open_db(path: &Path, options: DbOptions) -> Db {
    Db::open(path, options).expect("open")
}

/// Clean close + drop + reopen cycle.
pub fn reopen(db: Db, path: &Path, options: DbOptions) -> Db {
    db.close().expect("close");
    drop(db);
    Db::open(path, options).expect("reopen")
}

/// Collects every visible `(key, value)` pair through a forward scan.
pub fn collect_all(db: &Db) -> Vec<(Vec<u8>, Vec<u8>)> {
    collect_with(db, &ReadOptions::default())
}

/// Collects every visible `(key, value)` pair under the given options.
pub fn collect_with(db: &Db, opts: &ReadOptions) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut iter = db.iter(opts).expect("iter");
    let mut out = Vec::new();
    iter.seek_to_first();
    while iter.valid() {
        out.push((iter.key().to_vec(), iter.value().to_vec()));
        iter.next();
    }
    assert!(iter.error().is_none(), "iterator error: {:?}", iter.error());
    out
}

/// Collects keys only.
pub fn collect_keys(db: &Db) -> Vec<Vec<u8>> {
    collect_all(db).into_iter().map(|(k, _)| k).collect()
}

/// Concatenating merge operator used across merge tests: the merged
/// value is `base ∥ "," ∥ operand_oldest ∥ … ∥ operand_newest`.
pub struct ConcatOperator;

impl MergeOperator for ConcatOperator {
    fn name(&self) -> &str {
        "test.ConcatOperator"
    }

    fn full_merge(
        &self,
        _key: &[u8],
        base: Option<&[u8]>,
        operands: &[Vec<u8>],
    ) -> Option<Vec<u8>> {
        let mut out = base.map(<[u8]>::to_vec).unwrap_or_default();
        // Operands arrive newest-first; fold oldest-first.
        for operand in operands.iter().rev() {
            if !out.is_empty() {
                out.push(b',');
            }
            out.extend_from_slice(operand);
        }
        Some(out)
    }
}

/// Options wired with the concatenating merge operator.
pub fn merge_options() -> DbOptions {
    init_tracing();
    DbOptions {
        create_if_missing: true,
        write_buffer_size: 64 * 1024 * 1024,
        merge_operator: Some(Arc::new(ConcatOperator)),
        ..DbOptions::default()
    }
}
