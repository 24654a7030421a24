//! # Engine Configuration
//!
//! Options recognised by [`Db::open`](crate::engine::Db::open) plus the
//! pluggable behaviors injected through them: the user-key
//! [`Comparator`], the [`MergeOperator`], the optional
//! [`PrefixExtractor`], and the optional [`CompactionFilter`].
//!
//! These trait objects sit off the hot path (a handful of virtual calls
//! per operation), so dynamic dispatch is used throughout.

use std::sync::Arc;
use std::time::Duration;

use crate::keys::{BytewiseComparator, ComparatorRef, SequenceNumber};

// ------------------------------------------------------------------------------------------------
// Injected traits
// ------------------------------------------------------------------------------------------------

pub use crate::keys::Comparator;

/// Folds merge operands into a value.
///
/// Required to use `merge()`; reads and compaction call
/// [`full_merge`](MergeOperator::full_merge) with the base value (if a
/// put was found below the operands) and the operands newest-first.
pub trait MergeOperator: Send + Sync {
    /// Stable identifier, for diagnostics.
    fn name(&self) -> &str;

    /// Computes the merged value.
    ///
    /// `base` is the newest put at or below the operands, `None` when the
    /// key's history bottoms out in a deletion or nothing at all.
    /// `operands` are ordered newest-first. Returning `None` signals a
    /// merge failure; the read or compaction surfaces a corruption error.
    fn full_merge(&self, key: &[u8], base: Option<&[u8]>, operands: &[Vec<u8>])
    -> Option<Vec<u8>>;
}

/// Shared handle to a merge operator.
pub type MergeOperatorRef = Arc<dyn MergeOperator>;

/// Maps a user key to the prefix used for prefix-scoped iteration.
pub trait PrefixExtractor: Send + Sync {
    /// Stable identifier, for diagnostics.
    fn name(&self) -> &str;

    /// The prefix of `key`, always a leading slice of it.
    fn prefix<'k>(&self, key: &'k [u8]) -> &'k [u8];
}

/// Shared handle to a prefix extractor.
pub type PrefixExtractorRef = Arc<dyn PrefixExtractor>;

/// Decision returned by a [`CompactionFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Keep the record unchanged.
    Keep,

    /// Drop the record from the compaction output.
    Remove,
}

/// User hook consulted by compaction for each surviving put below the
/// oldest snapshot.
pub trait CompactionFilter: Send + Sync {
    /// Stable identifier, for diagnostics.
    fn name(&self) -> &str;

    /// Decides the fate of a `(key, value)` pair at `level`.
    fn filter(&self, level: usize, key: &[u8], value: &[u8]) -> FilterDecision;
}

/// Shared handle to a compaction filter.
pub type CompactionFilterRef = Arc<dyn CompactionFilter>;

// ------------------------------------------------------------------------------------------------
// Compression
// ------------------------------------------------------------------------------------------------

/// Compression algorithm applied by the SSTable writer.
///
/// The chosen codec is recorded in each table's properties block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionType {
    /// Store blocks uncompressed.
    #[default]
    None = 0,
}

impl CompressionType {
    /// Decodes an on-disk tag byte.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            _ => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// DbOptions
// ------------------------------------------------------------------------------------------------

/// Engine-wide configuration, passed to [`Db::open`](crate::engine::Db::open).
#[derive(Clone)]
pub struct DbOptions {
    /// Create the database if no database exists at the path; otherwise
    /// opening a missing database fails.
    pub create_if_missing: bool,

    /// Fail with a database-exists error if a database is already
    /// present at the path.
    pub error_if_exists: bool,

    /// Memtable size threshold (bytes) for the switch to immutable.
    pub write_buffer_size: usize,

    /// Stop-writes threshold on unflushed memtables (active + immutable).
    pub max_write_buffer_number: usize,

    /// L0 file count at which writes are delayed.
    pub level0_slowdown_writes_trigger: usize,

    /// L0 file count at which writes stop.
    pub level0_stop_writes_trigger: usize,

    /// L0 file count that triggers an automatic L0 → L1 compaction.
    pub level0_file_num_compaction_trigger: usize,

    /// Disable background compaction. L0 stall triggers are ignored
    /// while set.
    pub disable_auto_compactions: bool,

    /// Target size for individual compaction output files (bytes).
    pub target_file_size: u64,

    /// Total-size target for L1 (bytes); each deeper level multiplies
    /// this by [`level_size_multiplier`](Self::level_size_multiplier).
    pub max_bytes_for_level_base: u64,

    /// Per-level size multiplier for the compaction score.
    pub level_size_multiplier: u64,

    /// User-key ordering. The comparator name is persisted in SSTables
    /// and checked at open.
    pub comparator: ComparatorRef,

    /// Merge operand folding; required to use `merge()`.
    pub merge_operator: Option<MergeOperatorRef>,

    /// Compression algorithm used by the SSTable writer.
    pub compression: CompressionType,

    /// Optional prefix hashing for prefix iteration.
    pub prefix_extractor: Option<PrefixExtractorRef>,

    /// Optional user hook for dropping records during compaction.
    pub compaction_filter: Option<CompactionFilterRef>,

    /// While set, obsolete files are only scheduled — never unlinked.
    pub disable_file_deletions: bool,
}

impl DbOptions {
    /// Number of LSM levels.
    pub const NUM_LEVELS: usize = 7;
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_write_buffer_number: 2,
            level0_slowdown_writes_trigger: 8,
            level0_stop_writes_trigger: 12,
            level0_file_num_compaction_trigger: 4,
            disable_auto_compactions: false,
            target_file_size: 2 * 1024 * 1024,
            max_bytes_for_level_base: 10 * 1024 * 1024,
            level_size_multiplier: 10,
            comparator: Arc::new(BytewiseComparator),
            merge_operator: None,
            compression: CompressionType::None,
            prefix_extractor: None,
            compaction_filter: None,
            disable_file_deletions: false,
        }
    }
}

impl std::fmt::Debug for DbOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbOptions")
            .field("create_if_missing", &self.create_if_missing)
            .field("error_if_exists", &self.error_if_exists)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("max_write_buffer_number", &self.max_write_buffer_number)
            .field(
                "level0_slowdown_writes_trigger",
                &self.level0_slowdown_writes_trigger,
            )
            .field(
                "level0_stop_writes_trigger",
                &self.level0_stop_writes_trigger,
            )
            .field(
                "level0_file_num_compaction_trigger",
                &self.level0_file_num_compaction_trigger,
            )
            .field("disable_auto_compactions", &self.disable_auto_compactions)
            .field("comparator", &self.comparator.name())
            .field("merge_operator", &self.merge_operator.as_ref().map(|m| m.name()))
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Per-operation options
// ------------------------------------------------------------------------------------------------

/// Per-write options.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// fsync the WAL before acknowledging the write.
    pub sync: bool,

    /// Skip the WAL entirely. Unflushed writes may be lost on crash.
    pub disable_wal: bool,

    /// Abandon the write with a stall-timeout error if the write
    /// controller stays stopped longer than this.
    pub stall_timeout: Option<Duration>,
}

/// Per-read options.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Read at this sequence instead of the latest visible state.
    ///
    /// Normally populated from [`Snapshot::sequence`](crate::engine::Snapshot::sequence).
    pub snapshot: Option<SequenceNumber>,

    /// Inclusive lower bound for iteration.
    pub lower_bound: Option<Vec<u8>>,

    /// Exclusive upper bound for iteration.
    pub upper_bound: Option<Vec<u8>>,

    /// Stop iterating once the key's prefix (per the configured
    /// prefix extractor) differs from the seek target's prefix.
    pub prefix_same_as_start: bool,
}
