//! The binary marshaller and unmarshaller.
//!
//! Every value is encoded/decoded against an absolute offset tracked from
//! the *start of the message*, not the start of whatever buffer happens to
//! hold it — see [`crate::buf::AlignedBuf`]/[`crate::buf::Cursor`].

use dbus_peer_core::{
    BasicValue, Endianness, ObjectPathBuf, Signature, SignatureBuf, Value,
};

use crate::buf::{AlignedBuf, Cursor, MAX_ARRAY_LENGTH};
use crate::error::{Error, ErrorKind, Result};

const MAX_TOTAL_DEPTH: u32 = 64;

/// Encode `value` into `buf`, which must already be positioned (via
/// [`AlignedBuf::position`]) at an offset relative to the message start.
pub(crate) fn encode(buf: &mut AlignedBuf, endianness: Endianness, value: &Value) -> Result<()> {
    encode_depth(buf, endianness, value, 0)
}

fn encode_depth(buf: &mut AlignedBuf, endianness: Endianness, value: &Value, depth: u32) -> Result<()> {
    if depth > MAX_TOTAL_DEPTH {
        return Err(ErrorKind::ExceededDepth.into());
    }

    match value {
        Value::Basic(basic) => encode_basic(buf, endianness, basic),
        Value::Array(elem_sig, items) => {
            buf.align(4);
            // Reserve the length prefix; patched once the body is known.
            let len_at = buf.as_slice().len();
            buf.extend_from_slice(&[0; 4]);

            // Array alignment padding follows the length field even when
            // the array is empty.
            buf.align(elem_sig.alignment() as usize);
            let body_start = buf.as_slice().len();

            for item in items {
                encode_depth(buf, endianness, item, depth + 1)?;
            }

            let body_len = buf.as_slice().len() - body_start;

            if body_len as u64 > MAX_ARRAY_LENGTH as u64 {
                return Err(ErrorKind::FrameTooLarge(body_len as u32).into());
            }

            patch_u32(buf, len_at, body_len as u32, endianness);
            Ok(())
        }
        Value::Struct(fields) => {
            buf.align(8);

            for field in fields {
                encode_depth(buf, endianness, field, depth + 1)?;
            }

            Ok(())
        }
        Value::DictEntry(key, value) => {
            buf.align(8);
            encode_basic(buf, endianness, key)?;
            encode_depth(buf, endianness, value, depth + 1)
        }
        Value::Variant(inner) => {
            let sig = inner.signature();
            encode_signature(buf, &sig);
            encode_depth(buf, endianness, inner, depth + 1)
        }
    }
}

fn encode_basic(buf: &mut AlignedBuf, endianness: Endianness, basic: &BasicValue) -> Result<()> {
    match basic {
        BasicValue::Byte(v) => buf.extend_from_slice(&[*v]),
        BasicValue::Boolean(v) => encode_u32(buf, endianness, if *v { 1 } else { 0 }),
        BasicValue::Int16(v) => encode_u16(buf, endianness, *v as u16),
        BasicValue::UInt16(v) => encode_u16(buf, endianness, *v),
        BasicValue::Int32(v) => encode_u32(buf, endianness, *v as u32),
        BasicValue::UInt32(v) => encode_u32(buf, endianness, *v),
        BasicValue::Int64(v) => encode_u64(buf, endianness, *v as u64),
        BasicValue::UInt64(v) => encode_u64(buf, endianness, *v),
        BasicValue::Double(v) => encode_u64(buf, endianness, v.to_bits()),
        BasicValue::UnixFd(v) => encode_u32(buf, endianness, *v),
        BasicValue::String(s) => encode_string(buf, endianness, s.as_bytes()),
        BasicValue::ObjectPath(p) => encode_string(buf, endianness, p.as_str().as_bytes()),
        BasicValue::Signature(sig) => encode_signature(buf, sig),
    }

    Ok(())
}

fn encode_u16(buf: &mut AlignedBuf, endianness: Endianness, v: u16) {
    buf.align(2);
    let bytes = swap_u16(v, endianness).to_ne_bytes();
    buf.extend_from_slice(&bytes);
}

fn encode_u32(buf: &mut AlignedBuf, endianness: Endianness, v: u32) {
    buf.align(4);
    let bytes = swap_u32(v, endianness).to_ne_bytes();
    buf.extend_from_slice(&bytes);
}

fn encode_u64(buf: &mut AlignedBuf, endianness: Endianness, v: u64) {
    buf.align(8);
    let bytes = swap_u64(v, endianness).to_ne_bytes();
    buf.extend_from_slice(&bytes);
}

fn encode_string(buf: &mut AlignedBuf, endianness: Endianness, bytes: &[u8]) {
    encode_u32(buf, endianness, bytes.len() as u32);
    buf.extend_from_slice(bytes);
    buf.extend_from_slice(&[0]);
}

fn encode_signature(buf: &mut AlignedBuf, sig: &Signature) {
    buf.extend_from_slice(&[sig.len() as u8]);
    buf.extend_from_slice(sig.as_bytes());
    buf.extend_from_slice(&[0]);
}

fn patch_u32(buf: &mut AlignedBuf, at: usize, value: u32, endianness: Endianness) {
    let bytes = swap_u32(value, endianness).to_ne_bytes();
    // `AlignedBuf` doesn't expose mutable indexing; this is the one spot the
    // marshaller needs to patch a previously-written length, so it goes
    // through `into_vec`-and-back via a small helper instead of unsafe punning.
    buf.patch(at, &bytes);
}

fn swap_u16(v: u16, endianness: Endianness) -> u16 {
    if endianness == Endianness::NATIVE {
        v
    } else {
        v.swap_bytes()
    }
}

fn swap_u32(v: u32, endianness: Endianness) -> u32 {
    if endianness == Endianness::NATIVE {
        v
    } else {
        v.swap_bytes()
    }
}

fn swap_u64(v: u64, endianness: Endianness) -> u64 {
    if endianness == Endianness::NATIVE {
        v
    } else {
        v.swap_bytes()
    }
}

/// Decode a value of the single complete type `sig` from `cursor`.
pub(crate) fn decode(cursor: &mut Cursor<'_>, endianness: Endianness, sig: &Signature) -> Result<Value> {
    decode_depth(cursor, endianness, sig, 0)
}

fn decode_depth(
    cursor: &mut Cursor<'_>,
    endianness: Endianness,
    sig: &Signature,
    depth: u32,
) -> Result<Value> {
    if depth > MAX_TOTAL_DEPTH {
        return Err(ErrorKind::ExceededDepth.into());
    }

    let code = *sig
        .as_bytes()
        .first()
        .ok_or_else(|| Error::from(ErrorKind::Corrupted("empty signature")))?;

    match code {
        b'y' => Ok(Value::Basic(BasicValue::Byte(cursor.take(1)?[0]))),
        b'b' => {
            let v = decode_u32(cursor, endianness)?;
            match v {
                0 => Ok(Value::Basic(BasicValue::Boolean(false))),
                1 => Ok(Value::Basic(BasicValue::Boolean(true))),
                _ => Err(ErrorKind::Corrupted("boolean value out of range").into()),
            }
        }
        b'n' => Ok(Value::Basic(BasicValue::Int16(decode_u16(cursor, endianness)? as i16))),
        b'q' => Ok(Value::Basic(BasicValue::UInt16(decode_u16(cursor, endianness)?))),
        b'i' => Ok(Value::Basic(BasicValue::Int32(decode_u32(cursor, endianness)? as i32))),
        b'u' => Ok(Value::Basic(BasicValue::UInt32(decode_u32(cursor, endianness)?))),
        b'x' => Ok(Value::Basic(BasicValue::Int64(decode_u64(cursor, endianness)? as i64))),
        b't' => Ok(Value::Basic(BasicValue::UInt64(decode_u64(cursor, endianness)?))),
        b'd' => Ok(Value::Basic(BasicValue::Double(f64::from_bits(decode_u64(
            cursor,
            endianness,
        )?)))),
        b'h' => Ok(Value::Basic(BasicValue::UnixFd(decode_u32(cursor, endianness)?))),
        b's' => Ok(Value::Basic(BasicValue::String(decode_string(cursor, endianness)?))),
        b'o' => {
            let s = decode_string(cursor, endianness)?;
            Ok(Value::Basic(BasicValue::ObjectPath(ObjectPathBuf::new(s)?)))
        }
        b'g' => Ok(Value::Basic(BasicValue::Signature(decode_signature(cursor)?))),
        b'v' => {
            let inner_sig = decode_signature(cursor)?;
            let value = decode_depth(cursor, endianness, &inner_sig, depth + 1)?;
            Ok(Value::Variant(Box::new(value)))
        }
        b'a' => {
            let elem_sig = Signature::new(&sig.as_bytes()[1..])?;
            let elem_sig = first_child(elem_sig)?;

            cursor.skip_padding(4)?;
            let byte_len = decode_u32(cursor, endianness)?;

            if byte_len > MAX_ARRAY_LENGTH {
                return Err(ErrorKind::FrameTooLarge(byte_len).into());
            }

            cursor.skip_padding(elem_sig.alignment() as usize)?;
            let end = cursor.position() + byte_len as usize;

            let mut items = Vec::new();

            while cursor.position() < end {
                items.push(decode_depth(cursor, endianness, elem_sig, depth + 1)?);
            }

            if cursor.position() != end {
                return Err(ErrorKind::Corrupted("array element overran its length").into());
            }

            Ok(Value::Array(elem_sig.to_owned(), items))
        }
        b'(' => {
            cursor.skip_padding(8)?;
            let inner = Signature::new(&sig.as_bytes()[1..sig.len() - 1])?;
            let mut fields = Vec::new();

            for child in inner.children() {
                fields.push(decode_depth(cursor, endianness, child, depth + 1)?);
            }

            Ok(Value::Struct(fields))
        }
        b'{' => {
            cursor.skip_padding(8)?;
            let inner = Signature::new(&sig.as_bytes()[1..sig.len() - 1])?;
            let mut children = inner.children();

            let key_sig = children
                .next()
                .ok_or_else(|| Error::from(ErrorKind::Corrupted("dict-entry missing key type")))?;
            let value_sig = children
                .next()
                .ok_or_else(|| Error::from(ErrorKind::Corrupted("dict-entry missing value type")))?;

            let key = match decode_depth(cursor, endianness, key_sig, depth + 1)? {
                Value::Basic(basic) => basic,
                _ => return Err(ErrorKind::Corrupted("dict-entry key was not basic").into()),
            };
            let value = decode_depth(cursor, endianness, value_sig, depth + 1)?;

            Ok(Value::DictEntry(Box::new(key), Box::new(value)))
        }
        other => Err(ErrorKind::InvalidSignature(dbus_peer_core::SignatureError::InvalidTypeCode(other)).into()),
    }
}

fn first_child(sig: &Signature) -> Result<&Signature> {
    sig.children()
        .next()
        .ok_or_else(|| Error::from(ErrorKind::Corrupted("expected a single complete type")))
}

fn decode_u16(cursor: &mut Cursor<'_>, endianness: Endianness) -> Result<u16> {
    cursor.skip_padding(2)?;
    let bytes = cursor.take(2)?;
    let v = u16::from_ne_bytes(bytes.try_into().expect("length checked above"));
    Ok(swap_u16(v, endianness))
}

fn decode_u32(cursor: &mut Cursor<'_>, endianness: Endianness) -> Result<u32> {
    cursor.skip_padding(4)?;
    let bytes = cursor.take(4)?;
    let v = u32::from_ne_bytes(bytes.try_into().expect("length checked above"));
    Ok(swap_u32(v, endianness))
}

fn decode_u64(cursor: &mut Cursor<'_>, endianness: Endianness) -> Result<u64> {
    cursor.skip_padding(8)?;
    let bytes = cursor.take(8)?;
    let v = u64::from_ne_bytes(bytes.try_into().expect("length checked above"));
    Ok(swap_u64(v, endianness))
}

fn decode_string(cursor: &mut Cursor<'_>, endianness: Endianness) -> Result<String> {
    let len = decode_u32(cursor, endianness)? as usize;
    let bytes = cursor.take(len)?;
    let nul = cursor.take(1)?;

    if nul != [0] {
        return Err(ErrorKind::Corrupted("string not NUL-terminated").into());
    }

    validate_utf8(bytes)?;
    // `validate_utf8` already rejected anything `str::from_utf8` would, so
    // this is just asserting the type.
    Ok(core::str::from_utf8(bytes)
        .map_err(ErrorKind::InvalidUtf8)?
        .to_owned())
}

fn decode_signature(cursor: &mut Cursor<'_>) -> Result<SignatureBuf> {
    let len = cursor.take(1)?[0] as usize;
    let bytes = cursor.take(len)?;
    let nul = cursor.take(1)?;

    if nul != [0] {
        return Err(ErrorKind::Corrupted("signature not NUL-terminated").into());
    }

    Ok(Signature::new(bytes)?.to_owned())
}

/// Strict UTF-8 validation: no embedded NUL (the caller already excludes
/// the trailing one), codepoints `<= U+10FFFF`, no overlong sequences.
/// Noncharacters (e.g. U+FFFE) are permitted.
///
/// `str::from_utf8` already rejects overlong sequences and out-of-range
/// codepoints, so this only needs to additionally reject embedded NULs,
/// which D-Bus strings forbid but UTF-8 otherwise allows.
fn validate_utf8(bytes: &[u8]) -> Result<()> {
    let s = core::str::from_utf8(bytes).map_err(ErrorKind::InvalidUtf8)?;

    if s.contains('\0') {
        return Err(ErrorKind::Corrupted("string contains an embedded NUL").into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value, endianness: Endianness, base: usize) {
        let sig = value.signature();
        let mut buf = AlignedBuf::new(base);
        encode(&mut buf, endianness, &value).unwrap();
        let bytes = buf.into_vec();
        let mut cursor = Cursor::new(&bytes, base);
        let decoded = decode(&mut cursor, endianness, &sig).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(cursor.position() - base, bytes.len());
    }

    #[test]
    fn round_trips_every_basic_type_at_every_offset_and_endianness() {
        let values = vec![
            Value::Basic(BasicValue::Byte(7)),
            Value::Basic(BasicValue::Boolean(true)),
            Value::Basic(BasicValue::Int16(-5)),
            Value::Basic(BasicValue::UInt16(5)),
            Value::Basic(BasicValue::Int32(-500)),
            Value::Basic(BasicValue::UInt32(500)),
            Value::Basic(BasicValue::Int64(-70000)),
            Value::Basic(BasicValue::UInt64(70000)),
            Value::Basic(BasicValue::Double(1.5)),
            Value::Basic(BasicValue::String("hello".into())),
            Value::Basic(BasicValue::Signature(Signature::parse("a{sv}").unwrap().to_owned())),
        ];

        for value in values {
            for &endianness in &[Endianness::Little, Endianness::Big] {
                for &offset in &[0, 1, 3, 7, 8] {
                    round_trip(value.clone(), endianness, offset);
                }
            }
        }
    }

    #[test]
    fn round_trips_struct_and_array() {
        let value = Value::Struct(vec![
            Value::Basic(BasicValue::UInt32(1)),
            Value::Basic(BasicValue::String("x".into())),
        ]);
        round_trip(value, Endianness::Little, 0);

        let array = Value::Array(
            Signature::STRING.to_owned(),
            vec![
                Value::Basic(BasicValue::String("a".into())),
                Value::Basic(BasicValue::String("bb".into())),
            ],
        );
        round_trip(array, Endianness::Big, 3);
    }

    #[test]
    fn empty_array_still_pads_to_element_alignment() {
        let array = Value::Array(Signature::UINT64.to_owned(), vec![]);
        let mut buf = AlignedBuf::new(1);
        encode(&mut buf, Endianness::Little, &array).unwrap();
        let bytes = buf.into_vec();
        // align(4) pad (3) + 4-byte length + align(8) pad (0, since 1+3+4=8) = 7 bytes.
        assert_eq!(bytes.len(), 7);
    }

    #[test]
    fn rejects_non_nul_padding() {
        let mut buf = AlignedBuf::new(0);
        buf.extend_from_slice(&[1, 0, 0, 0]); // u32 value
        buf.extend_from_slice(&[1, 2, 3]); // bogus padding before an 8-aligned value
        buf.extend_from_slice(&1u64.to_ne_bytes());
        let bytes = buf.into_vec();
        let mut cursor = Cursor::new(&bytes, 0);
        let _ = decode_u32(&mut cursor, Endianness::NATIVE).unwrap();
        assert!(decode_u64(&mut cursor, Endianness::NATIVE).is_err());
    }

    #[test]
    fn round_trips_variant_and_dict_entry_array() {
        let variant = Value::Variant(Box::new(Value::Basic(BasicValue::Int32(-7))));
        round_trip(variant, Endianness::Little, 0);

        let entry = Value::DictEntry(
            Box::new(BasicValue::String("k".into())),
            Box::new(Value::Variant(Box::new(Value::Basic(BasicValue::Int32(1))))),
        );
        let elem_sig = entry.signature();
        let array = Value::Array(elem_sig, vec![entry]);
        round_trip(array, Endianness::Big, 5);
    }

    #[test]
    fn rejects_depth_beyond_limit() {
        let mut value = Value::Basic(BasicValue::Byte(1));
        for _ in 0..MAX_TOTAL_DEPTH + 2 {
            value = Value::Struct(vec![value]);
        }

        let mut buf = AlignedBuf::new(0);
        assert!(matches!(
            encode(&mut buf, Endianness::NATIVE, &value).unwrap_err().kind(),
            ErrorKind::ExceededDepth
        ));
    }
}
