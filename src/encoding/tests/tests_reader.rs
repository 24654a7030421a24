//! Reader cursor mechanics: consumption tracking, truncation reporting,
//! and the decode limits that guard against corrupted length fields.

use crate::encoding::*;

#[test]
fn cursor_tracks_consumption_across_mixed_fields() {
    let mut buf = Vec::new();
    put_u8(&mut buf, 0x2A);
    put_u64(&mut buf, 7_000_000_017);
    put_raw(&mut buf, b"SXST");
    put_bytes(&mut buf, b"payload").unwrap();

    let mut reader = Reader::new(&buf);
    assert_eq!(reader.consumed(), 0);
    assert_eq!(reader.remaining(), buf.len());

    assert_eq!(reader.u8().unwrap(), 0x2A);
    assert_eq!(reader.u64().unwrap(), 7_000_000_017);
    assert_eq!(reader.array::<4>().unwrap(), *b"SXST");
    assert_eq!(reader.bytes().unwrap(), b"payload");

    assert_eq!(reader.consumed(), buf.len());
    assert_eq!(reader.remaining(), 0);
}

#[test]
fn integers_are_little_endian_on_the_wire() {
    let mut buf = Vec::new();
    put_u32(&mut buf, 0x0A0B_0C0D);
    assert_eq!(buf, [0x0D, 0x0C, 0x0B, 0x0A]);

    let mut reader = Reader::new(&buf);
    assert_eq!(reader.u32().unwrap(), 0x0A0B_0C0D);
}

#[test]
fn truncation_reports_the_shortfall() {
    let mut reader = Reader::new(&[0x01, 0x02, 0x03]);
    match reader.u64().unwrap_err() {
        EncodingError::Truncated { wanted, left } => {
            assert_eq!(wanted, 8);
            assert_eq!(left, 3);
        }
        other => panic!("expected Truncated, got {other:?}"),
    }
    // A failed read must not advance the cursor.
    assert_eq!(reader.consumed(), 0);
    assert_eq!(reader.u8().unwrap(), 0x01);
}

#[test]
fn byte_string_roundtrips_and_borrows() {
    let mut buf = Vec::new();
    put_bytes(&mut buf, b"").unwrap();
    put_bytes(&mut buf, b"abc").unwrap();

    let mut reader = Reader::new(&buf);
    assert_eq!(reader.byte_slice().unwrap(), b"");
    let borrowed = reader.byte_slice().unwrap();
    assert_eq!(borrowed, b"abc");
    // The slice aliases the input buffer, not a copy.
    assert!(std::ptr::eq(borrowed.as_ptr(), buf[8..].as_ptr()));
}

#[test]
fn raw_reads_exactly_what_was_put() {
    let mut buf = Vec::new();
    put_raw(&mut buf, &[0xDE, 0xAD, 0xBE, 0xEF, 0x00]);

    let mut reader = Reader::new(&buf);
    assert_eq!(reader.raw(2).unwrap(), &[0xDE, 0xAD]);
    assert_eq!(reader.raw(3).unwrap(), &[0xBE, 0xEF, 0x00]);
    assert!(matches!(
        reader.raw(1).unwrap_err(),
        EncodingError::Truncated { wanted: 1, left: 0 }
    ));
}

#[test]
fn strings_validate_utf8() {
    let mut buf = Vec::new();
    put_str(&mut buf, "silexdb.BytewiseComparator").unwrap();

    let mut reader = Reader::new(&buf);
    assert_eq!(reader.string().unwrap(), "silexdb.BytewiseComparator");

    let mut bad = Vec::new();
    put_bytes(&mut bad, &[0xC3, 0x28]).unwrap();
    let mut reader = Reader::new(&bad);
    assert!(matches!(reader.string().unwrap_err(), EncodingError::Utf8(_)));
}

#[test]
fn oversized_length_field_rejected_before_allocation() {
    // Claim a byte string just past the limit, with no payload behind it.
    let mut buf = Vec::new();
    put_u32(&mut buf, MAX_BYTE_LEN + 1);

    let mut reader = Reader::new(&buf);
    match reader.byte_slice().unwrap_err() {
        EncodingError::Oversize { len, limit } => {
            assert_eq!(len, (MAX_BYTE_LEN + 1) as u64);
            assert_eq!(limit, MAX_BYTE_LEN as u64);
        }
        other => panic!("expected Oversize, got {other:?}"),
    }
}

#[test]
fn oversized_sequence_count_rejected_before_allocation() {
    let mut buf = Vec::new();
    put_u32(&mut buf, MAX_VEC_ELEMENTS + 1);

    let err = decode_vec::<Marker>(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::Oversize { .. }));
}

#[test]
fn claimed_length_larger_than_input_is_truncation_not_allocation() {
    let mut buf = Vec::new();
    put_u32(&mut buf, 1_000);
    put_raw(&mut buf, &[0xAA; 4]);

    let mut reader = Reader::new(&buf);
    assert!(matches!(
        reader.byte_slice().unwrap_err(),
        EncodingError::Truncated { wanted: 1_000, left: 4 }
    ));
}

/// Minimal Decode impl for the count-limit test.
#[derive(Debug)]
struct Marker;

impl Decode for Marker {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        reader.u8()?;
        Ok(Self)
    }
}
