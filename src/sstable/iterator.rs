//! SSTable iterators — block-level decode and table-wide traversal.
//!
//! - [`BlockEntries`] decodes a single data block into its cells.
//! - [`TableIter`] walks a whole table in internal-key order, in either
//!   direction, with `seek` / `seek_to_first` / `seek_to_last`.
//!
//! Blocks are small (4 KiB target), so each is decoded into a cell
//! vector on load; bidirectional movement is index arithmetic from
//! there. Only one decoded block is held at a time.

use std::ops::Deref;

use crate::encoding::{self, Decode};
use crate::keys::unpack_trailer;

use super::{PointEntry, SSTable, SSTableError, TableCell};

// ------------------------------------------------------------------------------------------------
// Block decode
// ------------------------------------------------------------------------------------------------

/// The decoded cells of a single data block, in ascending internal-key
/// order.
pub(crate) struct BlockEntries {
    entries: Vec<PointEntry>,
}

impl BlockEntries {
    /// Decodes a block payload (concatenated cells).
    ///
    /// A short or corrupt tail yields an error rather than a partial
    /// block, because a truncated cell means the framing checksum lied.
    pub(crate) fn decode(data: &[u8]) -> Result<Self, SSTableError> {
        let mut entries = Vec::new();
        let mut reader = encoding::Reader::new(data);

        while reader.remaining() > 0 {
            let cell = TableCell::decode(&mut reader)?;
            let user_key = reader.raw(cell.key_len as usize)?.to_vec();
            let value = reader.raw(cell.value_len as usize)?.to_vec();

            let (seq, kind) = unpack_trailer(cell.trailer)
                .ok_or_else(|| SSTableError::Internal("unknown value type tag".into()))?;

            entries.push(PointEntry {
                user_key,
                seq,
                kind,
                value,
            });
        }

        Ok(Self { entries })
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, idx: usize) -> Option<&PointEntry> {
        self.entries.get(idx)
    }
}

// ------------------------------------------------------------------------------------------------
// TableIter
// ------------------------------------------------------------------------------------------------

/// A seeking, bidirectional iterator over one table's point entries.
///
/// Positions are `(block index, entry index)`. An iterator starts
/// invalid; any seek establishes a position. Once invalid (walked off
/// either end), only a seek revalidates it.
///
/// Generic over how the table is held: `&SSTable` for borrowed reads,
/// `Arc<SSTable>` when the iterator must own its table (compaction
/// inputs, long-lived DB iterators).
pub struct TableIter<S: Deref<Target = SSTable> = &'static SSTable> {
    table: S,

    /// Index of the loaded block.
    block_idx: usize,

    /// Decoded cells of the loaded block, `None` when invalid.
    block: Option<BlockEntries>,

    /// Position within the loaded block.
    entry_idx: usize,
}

impl<S: Deref<Target = SSTable>> TableIter<S> {
    /// Creates an iterator; initially invalid.
    pub fn new(table: S) -> Result<Self, SSTableError> {
        Ok(Self {
            table,
            block_idx: 0,
            block: None,
            entry_idx: 0,
        })
    }

    /// `true` if the iterator points at an entry.
    pub fn valid(&self) -> bool {
        self.block
            .as_ref()
            .is_some_and(|b| self.entry_idx < b.len())
    }

    /// The entry under the cursor.
    pub fn current(&self) -> Option<&PointEntry> {
        self.block.as_ref().and_then(|b| b.get(self.entry_idx))
    }

    /// Positions at the first entry of the table.
    pub fn seek_to_first(&mut self) -> Result<(), SSTableError> {
        if self.table.index.is_empty() {
            self.block = None;
            return Ok(());
        }
        self.load_block(0)?;
        self.entry_idx = 0;
        Ok(())
    }

    /// Positions at the last entry of the table.
    pub fn seek_to_last(&mut self) -> Result<(), SSTableError> {
        if self.table.index.is_empty() {
            self.block = None;
            return Ok(());
        }
        let last = self.table.index.len() - 1;
        self.load_block(last)?;
        self.entry_idx = self.block.as_ref().map_or(0, |b| b.len().saturating_sub(1));
        Ok(())
    }

    /// Positions at the first entry whose internal key is ≥ `target`
    /// (in internal-key order: user asc, seq desc, type desc).
    ///
    /// Becomes invalid when every entry orders before `target`.
    pub fn seek(&mut self, target: &[u8]) -> Result<(), SSTableError> {
        if self.table.index.is_empty() {
            self.block = None;
            return Ok(());
        }

        let mut block_idx = self.table.find_block_for_key(target);
        self.load_block(block_idx)?;

        loop {
            let block = self
                .block
                .as_ref()
                .ok_or_else(|| SSTableError::Internal("seek lost its block".into()))?;

            // First entry in the block ≥ target.
            let mut found = None;
            for idx in 0..block.len() {
                let entry = block.get(idx).ok_or_else(|| {
                    SSTableError::Internal("block entry index out of range".into())
                })?;
                let key = entry.internal_key();
                if self.table.icmp.compare(&key, target) != std::cmp::Ordering::Less {
                    found = Some(idx);
                    break;
                }
            }

            match found {
                Some(idx) => {
                    self.entry_idx = idx;
                    return Ok(());
                }
                None => {
                    // Everything in this block orders before target.
                    block_idx += 1;
                    if block_idx >= self.table.index.len() {
                        self.block = None;
                        return Ok(());
                    }
                    self.load_block(block_idx)?;
                }
            }
        }
    }

    /// Advances to the next entry; invalid past the end.
    pub fn next(&mut self) -> Result<(), SSTableError> {
        let Some(block) = self.block.as_ref() else {
            return Ok(());
        };

        if self.entry_idx + 1 < block.len() {
            self.entry_idx += 1;
            return Ok(());
        }

        if self.block_idx + 1 < self.table.index.len() {
            let next_idx = self.block_idx + 1;
            self.load_block(next_idx)?;
            self.entry_idx = 0;
        } else {
            self.block = None;
        }
        Ok(())
    }

    /// Steps back to the previous entry; invalid before the start.
    pub fn prev(&mut self) -> Result<(), SSTableError> {
        if self.block.is_none() {
            return Ok(());
        }

        if self.entry_idx > 0 {
            self.entry_idx -= 1;
            return Ok(());
        }

        if self.block_idx > 0 {
            let prev_idx = self.block_idx - 1;
            self.load_block(prev_idx)?;
            self.entry_idx = self.block.as_ref().map_or(0, |b| b.len().saturating_sub(1));
        } else {
            self.block = None;
        }
        Ok(())
    }

    fn load_block(&mut self, idx: usize) -> Result<(), SSTableError> {
        let entry = &self.table.index[idx];
        let bytes = SSTable::read_block_bytes(&self.table.mmap, &entry.handle)?;
        let block = BlockEntries::decode(&bytes)?;
        if block.len() == 0 {
            return Err(SSTableError::Internal("empty data block".into()));
        }
        self.block_idx = idx;
        self.block = Some(block);
        self.entry_idx = 0;
        Ok(())
    }
}

impl<S: Deref<Target = SSTable>> std::fmt::Debug for TableIter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableIter")
            .field("file_number", &self.table.file_number)
            .field("block_idx", &self.block_idx)
            .field("entry_idx", &self.entry_idx)
            .field("valid", &self.valid())
            .finish()
    }
}
