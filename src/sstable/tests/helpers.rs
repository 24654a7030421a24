//! Shared construction helpers for SSTable tests.

use std::path::Path;
use std::sync::Arc;

use crate::config::CompressionType;
use crate::keys::{BytewiseComparator, ComparatorRef, ValueType};
use crate::sstable::{PointEntry, SSTable, SstWriter};
use crate::tombstone::RangeTombstone;

pub fn cmp() -> ComparatorRef {
    Arc::new(BytewiseComparator)
}

/// A put entry with formatted key/value.
pub fn put(key: &str, seq: u64, value: &str) -> PointEntry {
    PointEntry::new(key.as_bytes(), seq, ValueType::Value, value.as_bytes())
}

/// A point tombstone entry.
pub fn del(key: &str, seq: u64) -> PointEntry {
    PointEntry::new(key.as_bytes(), seq, ValueType::Deletion, b"".as_slice())
}

/// Builds a table at `path` from pre-sorted entries and tombstones.
pub fn build_table(path: &Path, entries: Vec<PointEntry>, tombstones: Vec<RangeTombstone>) {
    let count = entries.len();
    SstWriter::new(path, cmp(), CompressionType::None)
        .build(entries.into_iter(), count, tombstones)
        .unwrap();
}

/// Opens the table at `path` with the default comparator.
pub fn open_table(path: &Path, number: u64) -> SSTable {
    SSTable::open(path, number, cmp()).unwrap()
}

/// `n` sequential puts `key_000.. → value_000..` with seq = index + 1.
pub fn sequential_entries(n: usize) -> Vec<PointEntry> {
    (0..n)
        .map(|i| put(&format!("key_{i:03}"), (i + 1) as u64, &format!("value_{i:03}")))
        .collect()
}
