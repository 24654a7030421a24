//! Flush job — immutable memtable → L0 SSTable.
//!
//! The build runs on the flush worker with no engine lock held: the
//! memtable is immutable and reference-counted, so readers proceed
//! concurrently. The caller installs the result through a version edit
//! and only then clears the immutable slot.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::compaction::job::output_metadata;
use crate::config::DbOptions;
use crate::files;
use crate::memtable::Memtable;
use crate::sstable::{PointEntry, SstWriter};
use crate::version::FileMetaData;

use super::DbError;

/// Writes the immutable memtable's contents to table `file_number`.
///
/// Returns `None` without creating a file when the memtable holds
/// neither point entries nor range tombstones — the caller just clears
/// the immutable slot. On error any partial file is removed.
pub(crate) fn build_flush_file(
    dir: &Path,
    memtable: &Memtable,
    file_number: u64,
    opts: &DbOptions,
) -> Result<Option<Arc<FileMetaData>>, DbError> {
    let (records, mut tombstones) = memtable.iter_for_flush()?;

    if records.is_empty() && tombstones.is_empty() {
        debug!(file_number, "flush found empty memtable; abandoning");
        return Ok(None);
    }

    tombstones.sort_by(|a, b| {
        opts.comparator
            .compare(&a.start, &b.start)
            .then(b.seq.cmp(&a.seq))
    });

    let entries: Vec<PointEntry> = records
        .into_iter()
        .map(|r| PointEntry {
            user_key: r.user_key,
            seq: r.entry.seq,
            kind: r.entry.kind,
            value: r.entry.value,
        })
        .collect();

    let path = files::table_file_path(dir, file_number);
    let entry_count = entries.len();

    let build = SstWriter::new(&path, opts.comparator.clone(), opts.compression).build(
        entries.iter().cloned(),
        entry_count,
        tombstones.clone(),
    );
    if let Err(e) = build {
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("sst.tmp"));
        return Err(e.into());
    }

    let meta = output_metadata(file_number, &path, &entries, &tombstones, &opts.comparator)
        .map_err(|e| DbError::Internal(e.to_string()))?;

    info!(
        file_number,
        entries = entry_count,
        range_tombstones = tombstones.len(),
        bytes = meta.file_size,
        "memtable flushed to L0"
    );

    Ok(Some(Arc::new(meta)))
}
