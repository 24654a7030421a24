//! Compaction picker — decides which files compact where.
//!
//! Pure decisions over a [`Version`]: the caller (the engine, under its
//! lock) is responsible for marking the returned inputs
//! `being_compacted` before releasing the lock, and for rejecting the
//! plan if that claim fails.
//!
//! Input selection expands the source set on both sides until the user
//! key range stabilizes, so every version of a user key travels
//! together; at L0 every overlapping file is pulled in because L0 files
//! may overlap each other.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::config::DbOptions;
use crate::keys::ComparatorRef;
use crate::version::{FileMetaData, NUM_LEVELS, Version};

use super::{Compaction, CompactionReason};

// ------------------------------------------------------------------------------------------------
// Scoring
// ------------------------------------------------------------------------------------------------

/// Size target for `level` (≥ 1).
fn max_bytes_for_level(opts: &DbOptions, level: usize) -> u64 {
    let mut target = opts.max_bytes_for_level_base;
    for _ in 1..level {
        target = target.saturating_mul(opts.level_size_multiplier);
    }
    target
}

/// `(level, score)` of the most compaction-worthy level; `score ≥ 1.0`
/// means the level needs work.
fn best_level(version: &Version, opts: &DbOptions) -> (usize, f64) {
    let mut best = (0usize, f64::MIN);
    for level in 0..NUM_LEVELS - 1 {
        let score = if level == 0 {
            version.num_files(0) as f64 / opts.level0_file_num_compaction_trigger.max(1) as f64
        } else {
            version.level_total_size(level) as f64 / max_bytes_for_level(opts, level) as f64
        };
        if score > best.1 {
            best = (level, score);
        }
    }
    best
}

// ------------------------------------------------------------------------------------------------
// Key-range helpers
// ------------------------------------------------------------------------------------------------

/// The combined user-key span of `files`, as `(smallest, largest)`.
fn key_range(cmp: &ComparatorRef, files: &[Arc<FileMetaData>]) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut smallest: Option<&[u8]> = None;
    let mut largest: Option<&[u8]> = None;
    for f in files {
        if smallest.is_none_or(|cur| cmp.compare(&f.smallest.user_key, cur) == Ordering::Less) {
            smallest = Some(&f.smallest.user_key);
        }
        if largest.is_none_or(|cur| cmp.compare(&f.largest.user_key, cur) == Ordering::Greater) {
            largest = Some(&f.largest.user_key);
        }
    }
    Some((smallest?.to_vec(), largest?.to_vec()))
}

/// `true` when no level deeper than `output_level` holds files
/// overlapping `[smallest, largest]`.
fn is_bottom(version: &Version, output_level: usize, smallest: &[u8], largest: &[u8]) -> bool {
    ((output_level + 1)..NUM_LEVELS).all(|level| {
        version
            .overlapping_files(level, Some(smallest), Some(largest))
            .is_empty()
    })
}

/// `true` if any file is already claimed by another compaction.
fn any_being_compacted(files: &[Arc<FileMetaData>]) -> bool {
    files.iter().any(|f| f.is_being_compacted())
}

// ------------------------------------------------------------------------------------------------
// Automatic picking
// ------------------------------------------------------------------------------------------------

/// Picks the next automatic compaction, if any level needs one.
///
/// Returns `None` when no level crosses its trigger or when every
/// candidate input is already claimed.
pub fn pick_compaction(
    version: &Version,
    opts: &DbOptions,
    cmp: &ComparatorRef,
) -> Option<Compaction> {
    let (level, score) = best_level(version, opts);
    if score < 1.0 {
        return None;
    }

    let reason = if level == 0 {
        CompactionReason::Level0FileCount
    } else {
        CompactionReason::LevelSize
    };

    // Seed the input set.
    let seed: Vec<Arc<FileMetaData>> = if level == 0 {
        version.level_files(0).to_vec()
    } else {
        version
            .level_files(level)
            .iter()
            .find(|f| !f.is_being_compacted())
            .cloned()
            .into_iter()
            .collect()
    };
    if seed.is_empty() || any_being_compacted(&seed) {
        return None;
    }

    build_plan(version, opts, cmp, level, seed, reason)
}

/// Picks a manual compaction of `level` over `[begin, end]`
/// (`None` bounds are unbounded).
pub fn pick_manual_compaction(
    version: &Version,
    opts: &DbOptions,
    cmp: &ComparatorRef,
    level: usize,
    begin: Option<&[u8]>,
    end: Option<&[u8]>,
) -> Option<Compaction> {
    let seed = version.overlapping_files(level, begin, end);
    if seed.is_empty() || any_being_compacted(&seed) {
        return None;
    }
    build_plan(version, opts, cmp, level, seed, CompactionReason::Manual)
}

// ------------------------------------------------------------------------------------------------
// Plan construction
// ------------------------------------------------------------------------------------------------

/// Expands the seed to a stable key range, collects output-level
/// overlap, and rejects plans whose inputs are claimed elsewhere.
fn build_plan(
    version: &Version,
    _opts: &DbOptions,
    cmp: &ComparatorRef,
    level: usize,
    seed: Vec<Arc<FileMetaData>>,
    reason: CompactionReason,
) -> Option<Compaction> {
    let output_level = (level + 1).min(NUM_LEVELS - 1);

    // Expand within the source level until the key range stabilizes.
    let mut inputs = seed;
    loop {
        let (smallest, largest) = key_range(cmp, &inputs)?;
        let expanded = version.overlapping_files(level, Some(&smallest), Some(&largest));
        if expanded.len() == inputs.len() {
            break;
        }
        inputs = expanded;
    }
    if any_being_compacted(&inputs) {
        return None;
    }

    let (smallest, largest) = key_range(cmp, &inputs)?;
    let output_level_inputs = if output_level == level {
        Vec::new()
    } else {
        version.overlapping_files(output_level, Some(&smallest), Some(&largest))
    };
    if any_being_compacted(&output_level_inputs) {
        return None;
    }

    let bottom_level = is_bottom(version, output_level, &smallest, &largest);

    debug!(
        level,
        output_level,
        inputs = inputs.len(),
        overlap = output_level_inputs.len(),
        bottom_level,
        ?reason,
        "compaction picked"
    );

    Some(Compaction {
        level,
        output_level,
        inputs,
        output_level_inputs,
        bottom_level,
        reason,
    })
}
