//! Compaction job — merges the picked inputs into new output tables.
//!
//! The job runs on a background worker with no engine lock held. It
//! consumes the input tables through the table cache, merges them in
//! internal-key order, applies the visibility rules below, and writes
//! size-bounded outputs. The caller installs the outcome through a
//! version edit and deletes the inputs.
//!
//! ## Visibility rules
//!
//! `S` is the oldest outstanding snapshot sequence (or "max" when no
//! snapshot is held). Walking each user key newest-to-oldest:
//!
//! - every record with `seq > S` is kept verbatim;
//! - among records with `seq ≤ S`, only the newest survives — older
//!   ones are invisible to every snapshot;
//! - a surviving record covered by a range tombstone `t` with
//!   `record_seq < t ≤ S` is dropped;
//! - a surviving `Delete`/`SingleDelete` is dropped at the bottom level
//!   (nothing deeper can hold the key); a `SingleDelete` whose
//!   immediately-older record is a put consumes that put and vanishes;
//! - `Merge` operands accumulate and fold into a put when a base put or
//!   a tombstone is reached, or when the bottom level forces resolution;
//! - surviving range tombstones are clipped to each output file's key
//!   window; at the bottom level tombstones with `seq ≤ S` are dropped.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::config::DbOptions;
use crate::files;
use crate::keys::{
    HexKey, InternalKey, InternalKeyComparator, MAX_SEQUENCE, SequenceNumber, ValueType,
};
use crate::sstable::{PointEntry, SSTable, SstWriter, TableIter};
use crate::table_cache::TableCache;
use crate::tombstone::{RangeTombstone, RangeTombstoneAggregator};
use crate::version::FileMetaData;

use super::{Compaction, CompactionError};

// ------------------------------------------------------------------------------------------------
// Outcome
// ------------------------------------------------------------------------------------------------

/// The files a compaction produced, ready for a version edit.
#[derive(Debug, Default)]
pub struct CompactionOutcome {
    /// Metadata of every built output, in key order.
    pub outputs: Vec<Arc<FileMetaData>>,
}

// ------------------------------------------------------------------------------------------------
// Merge stream
// ------------------------------------------------------------------------------------------------

/// Forward-only k-way merge over the input tables, in internal-key
/// order. Children own their tables so the job needs no borrows into
/// the cache.
struct MergeStream {
    children: Vec<TableIter<Arc<SSTable>>>,
    icmp: InternalKeyComparator,
}

impl MergeStream {
    fn new(
        tables: Vec<Arc<SSTable>>,
        icmp: InternalKeyComparator,
    ) -> Result<Self, CompactionError> {
        let mut children = Vec::with_capacity(tables.len());
        for table in tables {
            let mut iter = TableIter::new(table)?;
            iter.seek_to_first()?;
            children.push(iter);
        }
        Ok(Self { children, icmp })
    }

    /// Pops the smallest entry across all children.
    fn next(&mut self) -> Result<Option<PointEntry>, CompactionError> {
        let mut best: Option<(usize, Vec<u8>)> = None;
        for (idx, child) in self.children.iter().enumerate() {
            let Some(entry) = child.current() else {
                continue;
            };
            let key = entry.internal_key();
            match &best {
                Some((_, best_key)) if self.icmp.compare(&key, best_key) != Ordering::Less => {}
                _ => best = Some((idx, key)),
            }
        }

        let Some((idx, _)) = best else {
            return Ok(None);
        };
        let entry = self.children[idx]
            .current()
            .cloned()
            .ok_or_else(|| CompactionError::Internal("merge child lost its entry".into()))?;
        self.children[idx].next()?;
        Ok(Some(entry))
    }
}

// ------------------------------------------------------------------------------------------------
// Job entry point
// ------------------------------------------------------------------------------------------------

/// Executes a picked compaction.
///
/// `next_file_number` allocates output file numbers; the engine backs
/// it with a brief engine-lock acquisition. On error the caller removes
/// partial outputs and clears the `being_compacted` claims.
pub fn run_compaction(
    compaction: &Compaction,
    dir: &Path,
    table_cache: &TableCache,
    opts: &DbOptions,
    oldest_snapshot: Option<SequenceNumber>,
    next_file_number: &mut dyn FnMut() -> u64,
) -> Result<CompactionOutcome, CompactionError> {
    let horizon = oldest_snapshot.unwrap_or(MAX_SEQUENCE);
    let icmp = InternalKeyComparator::new(opts.comparator.clone());

    info!(
        level = compaction.level,
        output_level = compaction.output_level,
        inputs = compaction.inputs.len(),
        overlap = compaction.output_level_inputs.len(),
        bottom = compaction.bottom_level,
        horizon,
        "compaction job started"
    );

    // Open every input through the cache.
    let mut tables = Vec::new();
    for meta in compaction.all_inputs() {
        tables.push(table_cache.get(meta.number)?);
    }

    // Collect input range tombstones; build the drop-decision aggregator.
    let mut input_tombstones: Vec<RangeTombstone> = Vec::new();
    let mut aggregator = RangeTombstoneAggregator::new(opts.comparator.clone(), horizon);
    for (idx, table) in tables.iter().enumerate() {
        input_tombstones.extend(table.range_tombstones());
        aggregator.add_tombstones(idx, table.fragmented_range_tombstones());
    }

    // Merge + per-key resolution, split into size-bounded output runs.
    let mut stream = MergeStream::new(tables, icmp.clone())?;
    let mut runs: Vec<Vec<PointEntry>> = Vec::new();
    let mut current_run: Vec<PointEntry> = Vec::new();
    let mut current_size: u64 = 0;

    let mut group: Vec<PointEntry> = Vec::new();
    loop {
        let next = stream.next()?;

        let group_done = match (&next, group.last()) {
            (Some(entry), Some(last)) => {
                icmp.compare_user(&entry.user_key, &last.user_key) != Ordering::Equal
            }
            (None, Some(_)) => true,
            _ => false,
        };

        if group_done {
            let emitted = resolve_user_key(
                std::mem::take(&mut group),
                horizon,
                compaction.bottom_level,
                compaction.output_level,
                &aggregator,
                opts,
            )?;
            for entry in emitted {
                current_size += (entry.user_key.len() + entry.value.len() + 16) as u64;
                current_run.push(entry);
            }
            // Split only at user-key boundaries so one key never spans
            // two output files of the same level.
            if current_size >= opts.target_file_size && !current_run.is_empty() {
                runs.push(std::mem::take(&mut current_run));
                current_size = 0;
            }
        }

        match next {
            Some(entry) => group.push(entry),
            None => break,
        }
    }
    if !current_run.is_empty() {
        runs.push(current_run);
    }

    // Surviving range tombstones.
    let surviving_tombstones: Vec<RangeTombstone> = if compaction.bottom_level {
        input_tombstones
            .into_iter()
            .filter(|t| t.seq > horizon)
            .collect()
    } else {
        input_tombstones
    };

    if runs.is_empty() && surviving_tombstones.is_empty() {
        debug!("compaction eliminated every record; no outputs");
        return Ok(CompactionOutcome::default());
    }
    if runs.is_empty() {
        // Tombstones with no surviving point data still need a carrier.
        runs.push(Vec::new());
    }

    // Build each output, clipping tombstones to its key window so
    // sibling outputs stay non-overlapping.
    let cmp = &opts.comparator;
    let mut outcome = CompactionOutcome::default();
    for (idx, run) in runs.iter().enumerate() {
        let window_lo = if idx == 0 {
            None
        } else {
            runs[idx].first().map(|e| e.user_key.clone())
        };
        let window_hi = runs.get(idx + 1).and_then(|next| {
            next.first().map(|e| e.user_key.clone())
        });

        let mut clipped: Vec<RangeTombstone> = Vec::new();
        for t in &surviving_tombstones {
            let mut start = t.start.clone();
            let mut end = t.end.clone();
            if let Some(lo) = &window_lo
                && cmp.compare(&start, lo) == Ordering::Less
            {
                start = lo.clone();
            }
            if let Some(hi) = &window_hi
                && cmp.compare(hi, &end) == Ordering::Less
            {
                end = hi.clone();
            }
            if cmp.compare(&start, &end) == Ordering::Less {
                clipped.push(RangeTombstone { start, end, seq: t.seq });
            }
        }
        clipped.sort_by(|a, b| cmp.compare(&a.start, &b.start).then(b.seq.cmp(&a.seq)));

        if run.is_empty() && clipped.is_empty() {
            continue;
        }

        let file_number = next_file_number();
        let path = files::table_file_path(dir, file_number);

        SstWriter::new(&path, opts.comparator.clone(), opts.compression)
            .build(run.iter().cloned(), run.len(), clipped.clone())?;

        let meta = output_metadata(file_number, &path, run, &clipped, cmp)?;
        trace!(
            file_number,
            entries = run.len(),
            tombstones = clipped.len(),
            smallest = %HexKey(&meta.smallest.user_key),
            largest = %HexKey(&meta.largest.user_key),
            "compaction output built"
        );
        outcome.outputs.push(Arc::new(meta));
    }

    info!(outputs = outcome.outputs.len(), "compaction job finished");
    Ok(outcome)
}

// ------------------------------------------------------------------------------------------------
// Per-key resolution
// ------------------------------------------------------------------------------------------------

/// Applies the visibility rules to all versions of one user key
/// (newest first). Returns the surviving entries, newest first.
fn resolve_user_key(
    mut versions: Vec<PointEntry>,
    horizon: SequenceNumber,
    bottom_level: bool,
    output_level: usize,
    aggregator: &RangeTombstoneAggregator,
    opts: &DbOptions,
) -> Result<Vec<PointEntry>, CompactionError> {
    if versions.is_empty() {
        return Ok(Vec::new());
    }

    // Recovery can re-flush WAL data a previous session already wrote
    // out, leaving identical records in two inputs. They arrive
    // adjacent in the merge order; keep one.
    versions.dedup_by(|a, b| a.seq == b.seq && a.kind == b.kind);

    let mut emitted = Vec::new();
    let mut iter = versions.into_iter().peekable();

    // Records above the snapshot horizon are kept verbatim.
    while let Some(entry) = iter.peek() {
        if entry.seq > horizon {
            emitted.push(iter.next().expect("peeked entry"));
        } else {
            break;
        }
    }

    // Newest record at or below the horizon decides the rest.
    let Some(newest) = iter.next() else {
        return Ok(emitted);
    };

    if aggregator.should_delete(&newest.user_key, newest.seq) {
        // Covered by a visible range tombstone; every older version is
        // covered as well.
        trace!(key = %HexKey(&newest.user_key), seq = newest.seq, "record covered by range tombstone");
        return Ok(emitted);
    }

    match newest.kind {
        ValueType::Value => {
            let keep = match &opts.compaction_filter {
                Some(filter) => matches!(
                    filter.filter(output_level, &newest.user_key, &newest.value),
                    crate::config::FilterDecision::Keep
                ),
                None => true,
            };
            if keep {
                emitted.push(newest);
            }
        }
        ValueType::Deletion => {
            if !bottom_level {
                emitted.push(newest);
            }
        }
        ValueType::SingleDeletion => {
            match iter.peek() {
                // The single-delete meets its put: both vanish.
                Some(older) if older.kind == ValueType::Value => {
                    let _ = iter.next();
                }
                _ => {
                    if !bottom_level {
                        emitted.push(newest);
                    }
                }
            }
        }
        ValueType::Merge => {
            let folded = fold_merge(newest, &mut iter, bottom_level, opts)?;
            emitted.extend(folded);
        }
        ValueType::RangeDeletion => {
            return Err(CompactionError::Internal(
                "range tombstone in point stream".into(),
            ));
        }
    }

    // Everything older is shadowed for every snapshot.
    Ok(emitted)
}

/// Accumulates merge operands starting at `first` and folds them when a
/// base is reached (or the bottom level forces resolution).
///
/// When no base exists among the inputs and deeper levels may still
/// hold one, the operand entries are re-emitted verbatim.
fn fold_merge(
    first: PointEntry,
    older: &mut std::iter::Peekable<std::vec::IntoIter<PointEntry>>,
    bottom_level: bool,
    opts: &DbOptions,
) -> Result<Vec<PointEntry>, CompactionError> {
    let user_key = first.user_key.clone();
    let newest_seq = first.seq;
    let mut operand_entries = vec![first];

    let base = loop {
        match older.peek().map(|e| e.kind) {
            Some(ValueType::Merge) => {
                operand_entries.push(older.next().expect("peeked entry"));
            }
            Some(ValueType::Value) => {
                let entry = older.next().expect("peeked entry");
                break Some(Some(entry.value));
            }
            Some(ValueType::Deletion) | Some(ValueType::SingleDeletion) => {
                let _ = older.next();
                break Some(None);
            }
            Some(ValueType::RangeDeletion) => {
                return Err(CompactionError::Internal(
                    "range tombstone in point stream".into(),
                ));
            }
            None => break None,
        }
    };

    let resolve_with = match base {
        Some(base) => Some(base),
        // No base among the inputs: deeper levels may still hold one,
        // unless this is the bottom.
        None if bottom_level => Some(None),
        None => None,
    };

    match resolve_with {
        Some(base) => {
            let operator = opts
                .merge_operator
                .as_ref()
                .ok_or(CompactionError::MergeOperatorNotSet)?;
            let operands: Vec<Vec<u8>> =
                operand_entries.iter().map(|e| e.value.clone()).collect();
            let merged = operator
                .full_merge(&user_key, base.as_deref(), &operands)
                .ok_or(CompactionError::MergeFailed)?;
            Ok(vec![PointEntry::new(
                user_key,
                newest_seq,
                ValueType::Value,
                merged,
            )])
        }
        None => Ok(operand_entries),
    }
}

// ------------------------------------------------------------------------------------------------
// Output metadata
// ------------------------------------------------------------------------------------------------

/// Builds the [`FileMetaData`] for one output from its contents.
///
/// Shared with the flush job, which produces L0 files the same way.
pub(crate) fn output_metadata(
    file_number: u64,
    path: &Path,
    entries: &[PointEntry],
    tombstones: &[RangeTombstone],
    cmp: &crate::keys::ComparatorRef,
) -> Result<FileMetaData, CompactionError> {
    let file_size = std::fs::metadata(path)?.len();

    let mut smallest: Option<InternalKey> = None;
    let mut largest: Option<InternalKey> = None;
    let mut smallest_seq = u64::MAX;
    let mut largest_seq = 0u64;

    let mut consider = |candidate: InternalKey| {
        match &smallest {
            Some(cur)
                if cmp.compare(&candidate.user_key, &cur.user_key) != Ordering::Less => {}
            _ => smallest = Some(candidate.clone()),
        }
        match &largest {
            Some(cur)
                if cmp.compare(&candidate.user_key, &cur.user_key) != Ordering::Greater => {}
            _ => largest = Some(candidate),
        }
    };

    if let Some(first) = entries.first() {
        consider(InternalKey::new(
            first.user_key.clone(),
            first.seq,
            first.kind,
        ));
    }
    if let Some(last) = entries.last() {
        consider(InternalKey::new(last.user_key.clone(), last.seq, last.kind));
    }
    for t in tombstones {
        consider(InternalKey::new(
            t.start.clone(),
            t.seq,
            ValueType::RangeDeletion,
        ));
        consider(InternalKey::new(t.end.clone(), 0, ValueType::RangeDeletion));
    }

    for e in entries {
        smallest_seq = smallest_seq.min(e.seq);
        largest_seq = largest_seq.max(e.seq);
    }
    for t in tombstones {
        smallest_seq = smallest_seq.min(t.seq);
        largest_seq = largest_seq.max(t.seq);
    }
    if smallest_seq == u64::MAX {
        smallest_seq = 0;
    }

    let smallest = smallest
        .ok_or_else(|| CompactionError::Internal("output without key bounds".into()))?;
    let largest = largest
        .ok_or_else(|| CompactionError::Internal("output without key bounds".into()))?;

    Ok(FileMetaData::new(
        file_number,
        file_size,
        smallest,
        largest,
        smallest_seq,
        largest_seq,
        0,
    ))
}
