//! # Compaction Module
//!
//! Leveled compaction: background merges that move data down the level
//! hierarchy, resolving shadowed versions and spent tombstones as
//! snapshots allow.
//!
//! ## Code organization
//!
//! The module separates **picking** (which files, which levels — pure
//! decisions over the current [`Version`](crate::version::Version)) from
//! **execution** (the merge itself, in [`job`]). The engine drives both:
//! it picks under the engine lock, marks inputs `being_compacted`, runs
//! the job outside the lock, and installs the resulting version edit as
//! the linearization point.
//!
//! ## Triggers
//!
//! - L0 → L1 when the L0 file count reaches
//!   `level0_file_num_compaction_trigger`.
//! - Ln → Ln+1 when level n's total size exceeds its target
//!   (`max_bytes_for_level_base × multiplier^(n−1)`).
//! - Manual compaction over a caller-supplied key range.

pub mod job;
pub mod picker;


pub use job::{CompactionOutcome, run_compaction};
pub use picker::{pick_compaction, pick_manual_compaction};

use std::sync::Arc;

use thiserror::Error;

use crate::sstable::SSTableError;
use crate::table_cache::TableCacheError;
use crate::version::FileMetaData;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Unified error type for compaction picking and execution.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// SSTable read or write failure.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Table cache failure.
    #[error("Table cache error: {0}")]
    TableCache(#[from] TableCacheError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Merge operands present but no merge operator configured.
    #[error("Merge operator not set")]
    MergeOperatorNotSet,

    /// The configured merge operator refused to fold operands.
    #[error("Merge operator failed for key")]
    MergeFailed,

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Compaction plan
// ------------------------------------------------------------------------------------------------

/// Why a compaction was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionReason {
    /// L0 file count reached the trigger.
    Level0FileCount,

    /// Level size exceeded its target.
    LevelSize,

    /// Caller-requested range compaction.
    Manual,
}

/// A picked compaction: input files claimed from two adjacent levels.
///
/// All files carry the `being_compacted` flag (set by the engine under
/// its lock) until the job installs or aborts.
#[derive(Debug)]
pub struct Compaction {
    /// Source level.
    pub level: usize,

    /// Output level (`level + 1`, or `level` when already at the
    /// bottom).
    pub output_level: usize,

    /// Input files from the source level.
    pub inputs: Vec<Arc<FileMetaData>>,

    /// Overlapping input files from the output level.
    pub output_level_inputs: Vec<Arc<FileMetaData>>,

    /// `true` when no deeper level holds data overlapping the inputs'
    /// key range — enables tombstone dropping.
    pub bottom_level: bool,

    /// Why this compaction was picked.
    pub reason: CompactionReason,
}

impl Compaction {
    /// Every input file across both levels.
    pub fn all_inputs(&self) -> impl Iterator<Item = &Arc<FileMetaData>> {
        self.inputs.iter().chain(self.output_level_inputs.iter())
    }

    /// Total input bytes.
    pub fn input_bytes(&self) -> u64 {
        self.all_inputs().map(|f| f.file_size).sum()
    }

    /// Releases the `being_compacted` claim on every input.
    pub fn release_inputs(&self) {
        for file in self.all_inputs() {
            file.set_being_compacted(false);
        }
    }
}
