//! # Internal Keys and Comparators
//!
//! Every mutation the engine stores is addressed by an *internal key*:
//! the user key followed by an 8-byte little-endian trailer packing the
//! 56-bit sequence number and the 8-bit value type:
//!
//! ```text
//! [user_key bytes][(seq << 8) | type, 8 bytes LE]
//! ```
//!
//! ## Ordering
//!
//! Internal keys order by user key ascending (per the injected
//! [`Comparator`]), then sequence descending, then type descending — so
//! the newest version of a user key compares smallest, which is what
//! seek semantics require.
//!
//! ## Comparator identity
//!
//! The user comparator has a stable [`Comparator::name`]. The name is
//! persisted into every SSTable and validated when the table is opened;
//! a mismatch is a format-incompatibility error, not silent reordering.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

// ------------------------------------------------------------------------------------------------
// Sequence numbers
// ------------------------------------------------------------------------------------------------

/// The engine's monotone logical clock. Stamped on every mutation.
pub type SequenceNumber = u64;

/// The largest representable sequence number (56 bits).
///
/// The trailer packs the sequence into the upper 56 bits of a `u64`,
/// leaving the low byte for the value type.
pub const MAX_SEQUENCE: SequenceNumber = (1 << 56) - 1;

/// Size of the internal-key trailer in bytes.
pub const TRAILER_SIZE: usize = 8;

// ------------------------------------------------------------------------------------------------
// Value types
// ------------------------------------------------------------------------------------------------

/// The kind of a stored record. 8-bit tag, persisted on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ValueType {
    /// Point deletion tombstone.
    Deletion = 0,

    /// A concrete value.
    Value = 1,

    /// A merge operand, folded by the configured merge operator.
    Merge = 2,

    /// Single-delete tombstone: removes exactly one earlier put.
    SingleDeletion = 7,

    /// Range deletion tombstone (stored out of line in meta blocks).
    RangeDeletion = 15,
}

impl ValueType {
    /// Decodes an on-disk tag byte.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Deletion),
            1 => Some(Self::Value),
            2 => Some(Self::Merge),
            7 => Some(Self::SingleDeletion),
            15 => Some(Self::RangeDeletion),
            _ => None,
        }
    }

    /// Returns `true` for point tombstones (`Deletion` / `SingleDeletion`).
    pub fn is_point_tombstone(self) -> bool {
        matches!(self, Self::Deletion | Self::SingleDeletion)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Deletion => "delete",
            Self::Value => "put",
            Self::Merge => "merge",
            Self::SingleDeletion => "single_delete",
            Self::RangeDeletion => "range_delete",
        };
        f.write_str(name)
    }
}

// ------------------------------------------------------------------------------------------------
// Trailer packing
// ------------------------------------------------------------------------------------------------

/// Packs `(seq, type)` into the 8-byte trailer value.
///
/// The caller must keep `seq ≤ MAX_SEQUENCE`; higher bits are masked.
#[inline]
pub fn pack_trailer(seq: SequenceNumber, kind: ValueType) -> u64 {
    ((seq & MAX_SEQUENCE) << 8) | kind as u64
}

/// Splits a trailer value back into `(seq, type)`.
///
/// Returns `None` if the type byte is not a recognised tag.
#[inline]
pub fn unpack_trailer(trailer: u64) -> Option<(SequenceNumber, ValueType)> {
    let kind = ValueType::from_u8((trailer & 0xFF) as u8)?;
    Some((trailer >> 8, kind))
}

// ------------------------------------------------------------------------------------------------
// Internal key encode / decode
// ------------------------------------------------------------------------------------------------

/// Appends the encoded internal key for `(user_key, seq, kind)` to `buf`.
#[inline]
pub fn append_internal_key(buf: &mut Vec<u8>, user_key: &[u8], seq: SequenceNumber, kind: ValueType) {
    buf.extend_from_slice(user_key);
    buf.extend_from_slice(&pack_trailer(seq, kind).to_le_bytes());
}

/// Builds an owned encoded internal key.
#[inline]
pub fn make_internal_key(user_key: &[u8], seq: SequenceNumber, kind: ValueType) -> Vec<u8> {
    let mut buf = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
    append_internal_key(&mut buf, user_key, seq, kind);
    buf
}

/// Extracts the user-key prefix of an encoded internal key.
///
/// Returns `None` if the slice is too short to carry a trailer.
#[inline]
pub fn extract_user_key(internal_key: &[u8]) -> Option<&[u8]> {
    internal_key
        .len()
        .checked_sub(TRAILER_SIZE)
        .map(|split| &internal_key[..split])
}

/// Extracts the `(seq, type)` pair from an encoded internal key.
///
/// Returns `None` on a short slice or unknown type tag.
#[inline]
pub fn extract_trailer(internal_key: &[u8]) -> Option<(SequenceNumber, ValueType)> {
    let split = internal_key.len().checked_sub(TRAILER_SIZE)?;
    let bytes: [u8; TRAILER_SIZE] = internal_key[split..].try_into().ok()?;
    unpack_trailer(u64::from_le_bytes(bytes))
}

/// A decoded `(user_key, seq, type)` triple with an owned user key.
///
/// Used wherever a component needs to carry a key boundary around
/// (file metadata, compaction input ranges) rather than raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    /// Opaque user key bytes.
    pub user_key: Vec<u8>,

    /// Sequence number of the mutation.
    pub seq: SequenceNumber,

    /// Record kind.
    pub kind: ValueType,
}

impl InternalKey {
    /// Creates a new internal key triple.
    pub fn new(user_key: impl Into<Vec<u8>>, seq: SequenceNumber, kind: ValueType) -> Self {
        Self {
            user_key: user_key.into(),
            seq,
            kind,
        }
    }

    /// Encodes this key into the on-disk byte form.
    pub fn encode(&self) -> Vec<u8> {
        make_internal_key(&self.user_key, self.seq, self.kind)
    }

    /// Decodes an internal key from its byte form.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let user_key = extract_user_key(bytes)?;
        let (seq, kind) = extract_trailer(bytes)?;
        Some(Self {
            user_key: user_key.to_vec(),
            seq,
            kind,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Comparators
// ------------------------------------------------------------------------------------------------

/// User-key ordering injected through the options struct.
///
/// Implementations must define a strict total order over arbitrary byte
/// strings. The [`name`](Comparator::name) identifies the ordering on
/// disk: SSTables record it at build time and reject readers configured
/// with a different comparator.
///
/// An application-defined fixed-width suffix ("user timestamp") is the
/// comparator's responsibility: it must order such keys correctly.
pub trait Comparator: Send + Sync {
    /// Stable identifier persisted into SSTables.
    fn name(&self) -> &str;

    /// Compares two user keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Shared handle to a user comparator.
pub type ComparatorRef = Arc<dyn Comparator>;

/// The default lexicographic byte-string comparator.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &str {
        "silexdb.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Orders encoded internal keys: user key ascending per the wrapped user
/// comparator, then trailer descending (seq descending, type descending).
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: ComparatorRef,
}

impl InternalKeyComparator {
    /// Wraps a user comparator.
    pub fn new(user: ComparatorRef) -> Self {
        Self { user }
    }

    /// The wrapped user comparator.
    pub fn user_comparator(&self) -> &ComparatorRef {
        &self.user
    }

    /// Compares two encoded internal keys.
    ///
    /// Keys missing a trailer sort before well-formed keys; this only
    /// arises on corrupted input, and the ordering keeps it deterministic.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match (extract_user_key(a), extract_user_key(b)) {
            (Some(ua), Some(ub)) => match self.user.compare(ua, ub) {
                Ordering::Equal => {
                    let ta = trailer_value(a);
                    let tb = trailer_value(b);
                    tb.cmp(&ta)
                }
                ord => ord,
            },
            (None, None) => a.cmp(b),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
        }
    }

    /// Compares two user keys with the wrapped comparator.
    pub fn compare_user(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user.compare(a, b)
    }
}

impl fmt::Debug for InternalKeyComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalKeyComparator")
            .field("user", &self.user.name())
            .finish()
    }
}

/// Reads the raw trailer of a well-formed internal key.
#[inline]
fn trailer_value(internal_key: &[u8]) -> u64 {
    let split = internal_key.len() - TRAILER_SIZE;
    let bytes: [u8; TRAILER_SIZE] = internal_key[split..]
        .try_into()
        .unwrap_or([0; TRAILER_SIZE]);
    u64::from_le_bytes(bytes)
}

// ------------------------------------------------------------------------------------------------
// Tracing helper
// ------------------------------------------------------------------------------------------------

/// Hex rendering of a key for log output. Long keys are truncated.
pub(crate) struct HexKey<'a>(pub &'a [u8]);

impl fmt::Display for HexKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() <= 32 {
            for byte in self.0 {
                write!(f, "{byte:02x}")?;
            }
        } else {
            for byte in &self.0[..16] {
                write!(f, "{byte:02x}")?;
            }
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}
