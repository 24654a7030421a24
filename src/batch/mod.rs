//! # Write Batches
//!
//! A [`WriteBatch`] is an owned byte buffer holding a framed sequence of
//! typed mutation records, applied atomically by
//! [`Db::write`](crate::engine::Db::write).
//!
//! ## Wire layout
//!
//! ```text
//! [base_seq u64 LE][count u32 LE]            header (12 bytes)
//! [tag u8][record fields…]                   repeated
//! ```
//!
//! Record fields are length-prefixed with the [`crate::encoding`] byte
//! format. Tags reuse the on-disk value-type codes; records targeting a
//! non-default column family set the high bit and carry a `u32` family
//! id before the key.
//!
//! The engine assigns the base sequence at commit time by patching the
//! header. The batch's raw bytes are exactly what gets appended to the
//! WAL, so replay re-applies the identical mutations.
//!
//! ## Invariants
//!
//! - After building via the typed methods, the header count equals the
//!   number of sequence-consuming records.
//! - [`iterate`](WriteBatch::iterate) reports records with their exact
//!   original kind; a single-delete is never surfaced as a plain delete.
//! - For externally produced batches ([`from_raw`](WriteBatch::from_raw))
//!   whose header under-reports, sequence accounting must use
//!   [`actual_count`](WriteBatch::actual_count), not the header field.


use thiserror::Error;

use crate::encoding::{self, EncodingError};
use crate::keys::ValueType;

/// Size of the `(base_seq, count)` batch header in bytes.
pub const BATCH_HEADER_SIZE: usize = 12;

/// Column-family id of the default family.
pub const DEFAULT_COLUMN_FAMILY: u32 = 0;

/// Tag-byte flag marking a record that carries an explicit family id.
const CF_FLAG: u8 = 0x80;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by batch construction and iteration.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The byte buffer is shorter than the fixed header.
    #[error("batch too small: {0} bytes")]
    TooSmall(usize),

    /// A record tag byte was not recognised.
    #[error("unknown record tag 0x{0:02x}")]
    UnknownTag(u8),

    /// A record's framed fields could not be decoded.
    #[error("malformed record: {0}")]
    Malformed(#[from] EncodingError),

    /// Error surfaced by the caller's [`BatchHandler`].
    #[error("handler error: {0}")]
    Handler(String),
}

// ------------------------------------------------------------------------------------------------
// Handler trait
// ------------------------------------------------------------------------------------------------

/// Receives one callback per logical record during
/// [`WriteBatch::iterate`], in insertion order.
///
/// Each method corresponds to exactly one record kind; implementations
/// that forward records elsewhere (memtable apply, batch copies) must
/// preserve the kind.
pub trait BatchHandler {
    /// A put of `key → value` in family `cf`.
    fn put(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<(), BatchError>;

    /// A point deletion of `key` in family `cf`.
    fn delete(&mut self, cf: u32, key: &[u8]) -> Result<(), BatchError>;

    /// A single-deletion of `key` in family `cf`.
    fn single_delete(&mut self, cf: u32, key: &[u8]) -> Result<(), BatchError>;

    /// A merge operand for `key` in family `cf`.
    fn merge(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<(), BatchError>;

    /// A range deletion of `[start, end)` in family `cf`.
    fn delete_range(&mut self, cf: u32, start: &[u8], end: &[u8]) -> Result<(), BatchError>;
}

// ------------------------------------------------------------------------------------------------
// WriteBatch
// ------------------------------------------------------------------------------------------------

/// An atomically-applied group of mutations. Owns its byte buffer.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    /// Header followed by framed records.
    data: Vec<u8>,

    /// At least one put record present.
    pub has_put: bool,

    /// At least one delete record present.
    pub has_delete: bool,

    /// At least one single-delete record present.
    pub has_single_delete: bool,

    /// At least one merge record present.
    pub has_merge: bool,

    /// At least one range-deletion record present.
    pub has_delete_range: bool,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self {
            data: vec![0; BATCH_HEADER_SIZE],
            has_put: false,
            has_delete: false,
            has_single_delete: false,
            has_merge: false,
            has_delete_range: false,
        }
    }

    /// Wraps an externally produced batch byte buffer.
    ///
    /// The buffer is validated structurally (header present, every
    /// record well-formed); the per-kind flags are recomputed from the
    /// actual records rather than trusted.
    pub fn from_raw(bytes: Vec<u8>) -> Result<Self, BatchError> {
        if bytes.len() < BATCH_HEADER_SIZE {
            return Err(BatchError::TooSmall(bytes.len()));
        }
        let mut batch = Self {
            data: bytes,
            has_put: false,
            has_delete: false,
            has_single_delete: false,
            has_merge: false,
            has_delete_range: false,
        };
        let mut flags = FlagScan::default();
        batch.iterate(&mut flags)?;
        batch.has_put = flags.put;
        batch.has_delete = flags.delete;
        batch.has_single_delete = flags.single_delete;
        batch.has_merge = flags.merge;
        batch.has_delete_range = flags.delete_range;
        Ok(batch)
    }

    /// The raw byte representation (exactly what the WAL stores).
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the batch, returning its byte buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Number of sequence-consuming records per the header field.
    pub fn count(&self) -> u32 {
        u32::from_le_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    /// `true` if the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.data.len() == BATCH_HEADER_SIZE
    }

    /// Approximate in-memory size of the batch in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.data.len()
    }

    /// The base sequence stamped in the header.
    pub fn sequence(&self) -> u64 {
        let bytes: [u8; 8] = self.data[..8].try_into().unwrap_or([0; 8]);
        u64::from_le_bytes(bytes)
    }

    /// Stamps the base sequence into the header. Called by the engine at
    /// commit; record bytes are untouched.
    pub fn set_sequence(&mut self, seq: u64) {
        self.data[..8].copy_from_slice(&seq.to_le_bytes());
    }

    /// Resets the batch to empty and clears all flags.
    pub fn clear(&mut self) {
        self.data.clear();
        self.data.resize(BATCH_HEADER_SIZE, 0);
        self.has_put = false;
        self.has_delete = false;
        self.has_single_delete = false;
        self.has_merge = false;
        self.has_delete_range = false;
    }

    // --------------------------------------------------------------------
    // Record construction
    // --------------------------------------------------------------------

    /// Appends a put of `key → value` to the default family.
    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.put_cf(DEFAULT_COLUMN_FAMILY, key, value);
    }

    /// Appends a put of `key → value` to family `cf`.
    pub fn put_cf(&mut self, cf: u32, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.push_tag(ValueType::Value as u8, cf);
        self.push_slice(key.as_ref());
        self.push_slice(value.as_ref());
        self.bump_count();
        self.has_put = true;
    }

    /// Appends a point deletion of `key` to the default family.
    pub fn delete(&mut self, key: impl AsRef<[u8]>) {
        self.delete_cf(DEFAULT_COLUMN_FAMILY, key);
    }

    /// Appends a point deletion of `key` to family `cf`.
    pub fn delete_cf(&mut self, cf: u32, key: impl AsRef<[u8]>) {
        self.push_tag(ValueType::Deletion as u8, cf);
        self.push_slice(key.as_ref());
        self.bump_count();
        self.has_delete = true;
    }

    /// Appends a single-deletion of `key` to the default family.
    pub fn single_delete(&mut self, key: impl AsRef<[u8]>) {
        self.single_delete_cf(DEFAULT_COLUMN_FAMILY, key);
    }

    /// Appends a single-deletion of `key` to family `cf`.
    pub fn single_delete_cf(&mut self, cf: u32, key: impl AsRef<[u8]>) {
        self.push_tag(ValueType::SingleDeletion as u8, cf);
        self.push_slice(key.as_ref());
        self.bump_count();
        self.has_single_delete = true;
    }

    /// Appends a merge operand for `key` to the default family.
    pub fn merge(&mut self, key: impl AsRef<[u8]>, operand: impl AsRef<[u8]>) {
        self.merge_cf(DEFAULT_COLUMN_FAMILY, key, operand);
    }

    /// Appends a merge operand for `key` to family `cf`.
    pub fn merge_cf(&mut self, cf: u32, key: impl AsRef<[u8]>, operand: impl AsRef<[u8]>) {
        self.push_tag(ValueType::Merge as u8, cf);
        self.push_slice(key.as_ref());
        self.push_slice(operand.as_ref());
        self.bump_count();
        self.has_merge = true;
    }

    /// Appends a range deletion of `[start, end)` to the default family.
    pub fn delete_range(&mut self, start: impl AsRef<[u8]>, end: impl AsRef<[u8]>) {
        self.delete_range_cf(DEFAULT_COLUMN_FAMILY, start, end);
    }

    /// Appends a range deletion of `[start, end)` to family `cf`.
    pub fn delete_range_cf(&mut self, cf: u32, start: impl AsRef<[u8]>, end: impl AsRef<[u8]>) {
        self.push_tag(ValueType::RangeDeletion as u8, cf);
        self.push_slice(start.as_ref());
        self.push_slice(end.as_ref());
        self.bump_count();
        self.has_delete_range = true;
    }

    // --------------------------------------------------------------------
    // Iteration
    // --------------------------------------------------------------------

    /// Replays every record through `handler` in insertion order.
    ///
    /// Record keys and values are handed to the handler as borrows of
    /// the batch's own buffer. Returns the number of records actually
    /// visited, which is the authoritative sequence-consumption count
    /// even when the header field disagrees.
    pub fn iterate<H: BatchHandler>(&self, handler: &mut H) -> Result<u32, BatchError> {
        let mut reader = encoding::Reader::new(&self.data[BATCH_HEADER_SIZE..]);
        let mut visited: u32 = 0;

        while reader.remaining() > 0 {
            let raw_tag = reader.u8()?;
            let (kind_tag, cf) = if raw_tag & CF_FLAG != 0 {
                (raw_tag & !CF_FLAG, reader.u32()?)
            } else {
                (raw_tag, DEFAULT_COLUMN_FAMILY)
            };

            let kind = ValueType::from_u8(kind_tag).ok_or(BatchError::UnknownTag(raw_tag))?;
            match kind {
                ValueType::Value => {
                    let key = reader.byte_slice()?;
                    let value = reader.byte_slice()?;
                    handler.put(cf, key, value)?;
                }
                ValueType::Deletion => {
                    let key = reader.byte_slice()?;
                    handler.delete(cf, key)?;
                }
                ValueType::SingleDeletion => {
                    let key = reader.byte_slice()?;
                    handler.single_delete(cf, key)?;
                }
                ValueType::Merge => {
                    let key = reader.byte_slice()?;
                    let operand = reader.byte_slice()?;
                    handler.merge(cf, key, operand)?;
                }
                ValueType::RangeDeletion => {
                    let start = reader.byte_slice()?;
                    let end = reader.byte_slice()?;
                    handler.delete_range(cf, start, end)?;
                }
            }

            visited += 1;
        }

        Ok(visited)
    }

    /// Counts the records actually present in the buffer.
    ///
    /// Sequence allocation uses this, not the header field, so a batch
    /// whose header under-reports still burns one sequence per record.
    pub fn actual_count(&self) -> Result<u32, BatchError> {
        let mut counter = CountScan::default();
        self.iterate(&mut counter)?;
        Ok(counter.count)
    }

    // --------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------

    fn push_tag(&mut self, kind_tag: u8, cf: u32) {
        if cf == DEFAULT_COLUMN_FAMILY {
            self.data.push(kind_tag);
        } else {
            self.data.push(kind_tag | CF_FLAG);
            encoding::put_u32(&mut self.data, cf);
        }
    }

    fn push_slice(&mut self, bytes: &[u8]) {
        // only fails past u32::MAX, unreachable for keys and values
        let _ = encoding::put_bytes(&mut self.data, bytes);
    }

    fn bump_count(&mut self) {
        let next = self.count().saturating_add(1);
        self.data[8..12].copy_from_slice(&next.to_le_bytes());
    }
}

// ------------------------------------------------------------------------------------------------
// Log encoding — a batch travels through the WAL as one framed record
// ------------------------------------------------------------------------------------------------

impl encoding::Encode for WriteBatch {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::put_bytes(buf, &self.data)
    }
}

impl encoding::Decode for WriteBatch {
    fn decode(reader: &mut encoding::Reader<'_>) -> Result<Self, EncodingError> {
        let data = reader.bytes()?;
        Self::from_raw(data).map_err(|e| EncodingError::Custom(format!("bad batch: {e}")))
    }
}

// ------------------------------------------------------------------------------------------------
// Internal scan handlers
// ------------------------------------------------------------------------------------------------

/// Counts records without touching them.
#[derive(Default)]
struct CountScan {
    count: u32,
}

impl BatchHandler for CountScan {
    fn put(&mut self, _cf: u32, _key: &[u8], _value: &[u8]) -> Result<(), BatchError> {
        self.count += 1;
        Ok(())
    }

    fn delete(&mut self, _cf: u32, _key: &[u8]) -> Result<(), BatchError> {
        self.count += 1;
        Ok(())
    }

    fn single_delete(&mut self, _cf: u32, _key: &[u8]) -> Result<(), BatchError> {
        self.count += 1;
        Ok(())
    }

    fn merge(&mut self, _cf: u32, _key: &[u8], _value: &[u8]) -> Result<(), BatchError> {
        self.count += 1;
        Ok(())
    }

    fn delete_range(&mut self, _cf: u32, _start: &[u8], _end: &[u8]) -> Result<(), BatchError> {
        self.count += 1;
        Ok(())
    }
}

/// Recomputes the per-kind presence flags for `from_raw`.
#[derive(Default)]
struct FlagScan {
    put: bool,
    delete: bool,
    single_delete: bool,
    merge: bool,
    delete_range: bool,
}

impl BatchHandler for FlagScan {
    fn put(&mut self, _cf: u32, _key: &[u8], _value: &[u8]) -> Result<(), BatchError> {
        self.put = true;
        Ok(())
    }

    fn delete(&mut self, _cf: u32, _key: &[u8]) -> Result<(), BatchError> {
        self.delete = true;
        Ok(())
    }

    fn single_delete(&mut self, _cf: u32, _key: &[u8]) -> Result<(), BatchError> {
        self.single_delete = true;
        Ok(())
    }

    fn merge(&mut self, _cf: u32, _key: &[u8], _value: &[u8]) -> Result<(), BatchError> {
        self.merge = true;
        Ok(())
    }

    fn delete_range(&mut self, _cf: u32, _start: &[u8], _end: &[u8]) -> Result<(), BatchError> {
        self.delete_range = true;
        Ok(())
    }
}
