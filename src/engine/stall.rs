//! Write controller — the stall state machine.
//!
//! Writers consult the controller before doing anything else. The
//! condition is recomputed under the engine lock whenever its inputs
//! change (memtable switch, flush completion, L0 file count change) and
//! broadcast to blocked writers through a condition variable owned by
//! the engine.
//!
//! | Condition | Trigger |
//! |---|---|
//! | Stopped   | `unflushed ≥ max_write_buffer_number`, or `L0 ≥ stop trigger` |
//! | Delayed   | `unflushed + 1 ≥ max_write_buffer_number`, or `L0 ≥ slowdown trigger` |
//! | Normal    | otherwise |
//!
//! L0 triggers are ignored while auto-compactions are disabled —
//! nothing would ever drain the level.

use std::time::Duration;

use tracing::debug;

use crate::config::DbOptions;

/// Why writes are stalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallCause {
    /// Too many unflushed memtables.
    MemtableLimit,

    /// Too many L0 files.
    L0FileCountLimit,
}

/// The write-admission condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStallCondition {
    /// Writes proceed immediately.
    Normal,

    /// Writes are rate-limited.
    Delayed(StallCause),

    /// Writes block until the condition clears.
    Stopped(StallCause),
}

/// Computes the stall condition from its inputs.
///
/// `num_unflushed` counts the active memtable plus the immutable one if
/// present (1 or 2 in the baseline configuration).
pub fn compute_condition(
    opts: &DbOptions,
    num_unflushed: usize,
    num_l0_files: usize,
) -> WriteStallCondition {
    if num_unflushed >= opts.max_write_buffer_number {
        return WriteStallCondition::Stopped(StallCause::MemtableLimit);
    }
    if !opts.disable_auto_compactions && num_l0_files >= opts.level0_stop_writes_trigger {
        return WriteStallCondition::Stopped(StallCause::L0FileCountLimit);
    }
    if num_unflushed + 1 >= opts.max_write_buffer_number {
        return WriteStallCondition::Delayed(StallCause::MemtableLimit);
    }
    if !opts.disable_auto_compactions && num_l0_files >= opts.level0_slowdown_writes_trigger {
        return WriteStallCondition::Delayed(StallCause::L0FileCountLimit);
    }
    WriteStallCondition::Normal
}

/// The delay applied for a `Delayed` condition, proportional to the
/// batch size: roughly one millisecond per 32 KiB, capped at 10 ms.
pub fn delay_for_batch(batch_bytes: usize) -> Duration {
    let millis = (batch_bytes as u64 / (32 * 1024)).clamp(1, 10);
    Duration::from_millis(millis)
}

/// Logs a condition transition; called under the engine lock.
pub fn trace_transition(old: WriteStallCondition, new: WriteStallCondition) {
    if old != new {
        debug!(?old, ?new, "write stall condition changed");
    }
}
