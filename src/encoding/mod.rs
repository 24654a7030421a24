//! On-disk byte encoding for silexdb's wire structures.
//!
//! Everything the engine persists — WAL headers and records, batch
//! records, SSTable cells and meta blocks, MANIFEST version edits —
//! goes through this module, so the byte layout is owned by the crate
//! and cannot drift underneath the files already on disk.
//!
//! The design is a thin writer/reader pair instead of per-primitive
//! trait impls:
//!
//! - **Writing** appends little-endian fixed-width integers and
//!   `u32`-length-prefixed byte strings to a `Vec<u8>` through the
//!   [`put_u32`]-family helpers.
//! - **Reading** walks a borrowed buffer through a bounds-checked
//!   [`Reader`] cursor. Field accessors either return the decoded value
//!   or a structured [`EncodingError`]; nothing in this module panics
//!   or reads past the end of the input.
//!
//! Composite wire structures implement [`Encode`] and [`Decode`] in
//! their own modules, field by field, so each format lives next to the
//! code that interprets it. Enum-shaped records (batch records, version
//! edits) write an explicit tag and treat unrecognised tags as hard
//! corruption — there is no skipping.
//!
//! # Decode limits
//!
//! Length fields come from disk and may be garbage, so variable-length
//! reads are capped before any allocation happens: [`MAX_BYTE_LEN`] for
//! a single byte string, [`MAX_VEC_ELEMENTS`] for a counted sequence.

#[cfg(test)]
mod tests;

use thiserror::Error;

/// Largest accepted byte-string length during decoding (256 MiB).
pub const MAX_BYTE_LEN: u32 = 256 * 1024 * 1024;

/// Largest accepted element count for a counted sequence (16 M).
pub const MAX_VEC_ELEMENTS: u32 = 16 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while encoding or decoding wire structures.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The input ended before the field did.
    #[error("truncated input: wanted {wanted} more bytes, {left} left")]
    Truncated {
        /// Bytes the current field still needed.
        wanted: usize,
        /// Bytes actually remaining.
        left: usize,
    },

    /// A tagged record carried a tag no decoder recognises.
    #[error("unknown tag {tag} while decoding {what}")]
    UnknownTag {
        /// The tag value read from the input.
        tag: u32,
        /// The structure being decoded.
        what: &'static str,
    },

    /// A string field held bytes that are not valid UTF-8.
    #[error("invalid UTF-8 in string field: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// A length or count field exceeded its decode limit.
    #[error("length {len} exceeds decode limit {limit}")]
    Oversize {
        /// The length or count the input claimed.
        len: u64,
        /// The limit it tripped.
        limit: u64,
    },

    /// Structure-specific decode failure.
    #[error("{0}")]
    Custom(String),
}

// ------------------------------------------------------------------------------------------------
// Traits
// ------------------------------------------------------------------------------------------------

/// A structure with a byte representation on disk.
///
/// Implementations must be deterministic: the same value always
/// produces the same bytes.
pub trait Encode {
    /// Appends the encoded representation of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// A structure decodable from its [`Encode`] representation.
pub trait Decode: Sized {
    /// Reads one value from the cursor, leaving it positioned at the
    /// next field.
    fn decode(reader: &mut Reader<'_>) -> Result<Self, EncodingError>;
}

/// Encodes a value into a fresh buffer.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decodes one value from the start of `buf`.
///
/// Returns `(value, bytes_consumed)` so callers framing their own
/// streams can advance past the decoded portion.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    let mut reader = Reader::new(buf);
    let value = T::decode(&mut reader)?;
    Ok((value, reader.consumed()))
}

// ------------------------------------------------------------------------------------------------
// Writer helpers
// ------------------------------------------------------------------------------------------------

/// Appends one raw byte.
pub fn put_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

/// Appends a `u32`, little-endian.
pub fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Appends a `u64`, little-endian.
pub fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Appends fixed-width bytes verbatim — no length prefix. The reader
/// must know the width (magic numbers, checksums rendered elsewhere).
pub fn put_raw(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(bytes);
}

/// Appends a `u32`-length-prefixed byte string.
pub fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), EncodingError> {
    let len = u32::try_from(bytes.len()).map_err(|_| EncodingError::Oversize {
        len: bytes.len() as u64,
        limit: u32::MAX as u64,
    })?;
    put_u32(buf, len);
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Appends a `u32`-length-prefixed UTF-8 string.
pub fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<(), EncodingError> {
    put_bytes(buf, s.as_bytes())
}

/// Appends a counted sequence: `[u32 count][item…]`.
pub fn encode_vec<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    let count = u32::try_from(items.len()).map_err(|_| EncodingError::Oversize {
        len: items.len() as u64,
        limit: u32::MAX as u64,
    })?;
    put_u32(buf, count);
    for item in items {
        item.encode_to(buf)?;
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Bounds-checked cursor over a borrowed input buffer.
///
/// Accessors consume from the front; [`consumed`](Reader::consumed)
/// reports how far the cursor has advanced, which is what framed-stream
/// callers need to step to the next record. Slice-returning accessors
/// borrow from the underlying buffer, so decoding can stay zero-copy
/// until a field is actually kept.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Starts a cursor at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Takes the next `wanted` bytes, or reports how short the input is.
    fn advance(&mut self, wanted: usize) -> Result<&'a [u8], EncodingError> {
        let left = self.remaining();
        if wanted > left {
            return Err(EncodingError::Truncated { wanted, left });
        }
        let slice = &self.buf[self.pos..self.pos + wanted];
        self.pos += wanted;
        Ok(slice)
    }

    /// Reads one byte.
    pub fn u8(&mut self) -> Result<u8, EncodingError> {
        Ok(self.advance(1)?[0])
    }

    /// Reads a little-endian `u32`.
    pub fn u32(&mut self) -> Result<u32, EncodingError> {
        let bytes = self.advance(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a little-endian `u64`.
    pub fn u64(&mut self) -> Result<u64, EncodingError> {
        let bytes = self.advance(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Reads a fixed-width byte array (the counterpart of [`put_raw`]).
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], EncodingError> {
        let bytes = self.advance(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Reads `len` bytes without a prefix, borrowed from the input.
    pub fn raw(&mut self, len: usize) -> Result<&'a [u8], EncodingError> {
        self.advance(len)
    }

    /// Reads a `u32`-length-prefixed byte string, borrowed from the
    /// input. The length is checked against [`MAX_BYTE_LEN`] before
    /// anything else happens.
    pub fn byte_slice(&mut self) -> Result<&'a [u8], EncodingError> {
        let len = self.u32()?;
        if len > MAX_BYTE_LEN {
            return Err(EncodingError::Oversize {
                len: len as u64,
                limit: MAX_BYTE_LEN as u64,
            });
        }
        self.advance(len as usize)
    }

    /// Reads a `u32`-length-prefixed byte string into an owned `Vec`.
    pub fn bytes(&mut self) -> Result<Vec<u8>, EncodingError> {
        Ok(self.byte_slice()?.to_vec())
    }

    /// Reads a `u32`-length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String, EncodingError> {
        Ok(String::from_utf8(self.bytes()?)?)
    }
}

/// Reads a counted sequence written by [`encode_vec`].
///
/// The count is capped at [`MAX_VEC_ELEMENTS`] before allocation.
pub fn read_vec<T: Decode>(reader: &mut Reader<'_>) -> Result<Vec<T>, EncodingError> {
    let count = reader.u32()?;
    if count > MAX_VEC_ELEMENTS {
        return Err(EncodingError::Oversize {
            len: count as u64,
            limit: MAX_VEC_ELEMENTS as u64,
        });
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(T::decode(reader)?);
    }
    Ok(items)
}

/// Decodes a counted sequence from the start of `buf`, returning the
/// items and the bytes consumed.
pub fn decode_vec<T: Decode>(buf: &[u8]) -> Result<(Vec<T>, usize), EncodingError> {
    let mut reader = Reader::new(buf);
    let items = read_vec(&mut reader)?;
    Ok((items, reader.consumed()))
}
