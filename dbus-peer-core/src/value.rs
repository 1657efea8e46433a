use crate::object_path::ObjectPathBuf;
use crate::signature::{Signature, SignatureBuf};

/// A basic (non-container) D-Bus value — the only kind allowed as a
/// dict-entry key.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum BasicValue {
    /// `y`
    Byte(u8),
    /// `b`, encoded on the wire as 0 or 1 in 32 bits.
    Boolean(bool),
    /// `n`
    Int16(i16),
    /// `q`
    UInt16(u16),
    /// `i`
    Int32(i32),
    /// `u`
    UInt32(u32),
    /// `x`
    Int64(i64),
    /// `t`
    UInt64(u64),
    /// `d`
    Double(f64),
    /// `h`, a u32 index into the out-of-band file descriptor array.
    UnixFd(u32),
    /// `s`
    String(String),
    /// `o`
    ObjectPath(ObjectPathBuf),
    /// `g`
    Signature(SignatureBuf),
}

impl BasicValue {
    /// The single complete type signature for this value.
    pub fn signature(&self) -> &'static Signature {
        match self {
            BasicValue::Byte(_) => Signature::BYTE,
            BasicValue::Boolean(_) => Signature::BOOLEAN,
            BasicValue::Int16(_) => Signature::INT16,
            BasicValue::UInt16(_) => Signature::UINT16,
            BasicValue::Int32(_) => Signature::INT32,
            BasicValue::UInt32(_) => Signature::UINT32,
            BasicValue::Int64(_) => Signature::INT64,
            BasicValue::UInt64(_) => Signature::UINT64,
            BasicValue::Double(_) => Signature::DOUBLE,
            BasicValue::UnixFd(_) => Signature::UNIX_FD,
            BasicValue::String(_) => Signature::STRING,
            BasicValue::ObjectPath(_) => Signature::OBJECT_PATH,
            BasicValue::Signature(_) => Signature::SIGNATURE,
        }
    }
}

/// A D-Bus value: a basic value, or one of the three container kinds plus
/// the self-describing variant.
///
/// Every value carries its signature implicitly, derivable from its tag —
/// there is no separate reflection step.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Value {
    /// A basic, non-container value.
    Basic(BasicValue),
    /// An array of values sharing a single element signature.
    ///
    /// The element signature is stored alongside the items so that an empty
    /// array still carries its type: array alignment padding must be
    /// written even when the array has zero elements.
    Array(SignatureBuf, Vec<Value>),
    /// A struct: heterogeneous values, always 8-aligned, never empty.
    Struct(Vec<Value>),
    /// A dict-entry: a basic key paired with a value. Only valid as the
    /// direct element type of an `Array`.
    DictEntry(Box<BasicValue>, Box<Value>),
    /// A self-describing variant, carrying its own signature and value.
    Variant(Box<Value>),
}

impl Value {
    /// The single complete type signature of this value.
    pub fn signature(&self) -> SignatureBuf {
        match self {
            Value::Basic(basic) => basic.signature().to_owned(),
            Value::Array(elem_sig, _) => {
                let mut buf = SignatureBuf::new();
                buf.push_signature(Signature::new_const(b"a"))
                    .expect("'a' always fits");
                buf.push_signature(elem_sig).expect("validated on construction");
                buf
            }
            Value::Struct(fields) => {
                let mut buf = SignatureBuf::new();
                buf.push_signature(Signature::new_const(b"("))
                    .expect("'(' always fits");
                for field in fields {
                    buf.push_signature(&field.signature())
                        .expect("struct field signatures fit");
                }
                buf.push_signature(Signature::new_const(b")"))
                    .expect("')' always fits");
                buf
            }
            Value::DictEntry(key, value) => {
                let mut buf = SignatureBuf::new();
                buf.push_signature(Signature::new_const(b"{"))
                    .expect("'{' always fits");
                buf.push_signature(key.signature())
                    .expect("dict key signature fits");
                buf.push_signature(&value.signature())
                    .expect("dict value signature fits");
                buf.push_signature(Signature::new_const(b"}"))
                    .expect("'}' always fits");
                buf
            }
            Value::Variant(_) => Signature::VARIANT.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_signature_round_trips() {
        let value = Value::Struct(vec![
            Value::Basic(BasicValue::UInt32(1)),
            Value::Basic(BasicValue::String("hi".into())),
        ]);
        assert_eq!(value.signature().as_bytes(), b"(us)");
    }

    #[test]
    fn array_of_dict_entries_signature() {
        let entry = Value::DictEntry(
            Box::new(BasicValue::String("k".into())),
            Box::new(Value::Variant(Box::new(Value::Basic(BasicValue::Int32(1))))),
        );
        let elem_sig = entry.signature();
        let array = Value::Array(elem_sig, vec![entry]);
        assert_eq!(array.signature().as_bytes(), b"a{sv}");
    }
}
