use core::fmt;

/// Maximum number of nested arrays a signature may contain.
const MAX_ARRAY_DEPTH: u32 = 32;
/// Maximum number of nested structs (or dict-entries) a signature may contain.
const MAX_STRUCT_DEPTH: u32 = 32;
/// Maximum length in bytes of a signature, per the D-Bus specification.
const MAX_LENGTH: usize = 255;

/// An error produced while parsing or validating a [`Signature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SignatureError {
    /// The signature is longer than the 255-byte limit.
    TooLong,
    /// A byte in the signature is not part of the type alphabet.
    InvalidTypeCode(u8),
    /// A struct (`()`) or dict-entry (`{}`) was left unterminated.
    UnterminatedContainer,
    /// A `)` or `}` was found with no matching opening bracket.
    UnbalancedContainer,
    /// A struct contained no fields.
    EmptyStruct,
    /// A dict-entry did not have exactly two children.
    DictEntryArity,
    /// A dict-entry's key was not a basic type.
    DictEntryKeyNotBasic,
    /// A dict-entry appeared outside of an array.
    DictEntryNotInArray,
    /// Array or struct nesting exceeded the maximum allowed depth.
    ExceededDepth,
}

impl SignatureError {
    pub(crate) fn too_long() -> Self {
        SignatureError::TooLong
    }
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureError::TooLong => write!(f, "signature exceeds {MAX_LENGTH} bytes"),
            SignatureError::InvalidTypeCode(byte) => {
                write!(f, "invalid type code {:?}", *byte as char)
            }
            SignatureError::UnterminatedContainer => write!(f, "unterminated struct or dict-entry"),
            SignatureError::UnbalancedContainer => write!(f, "unbalanced struct or dict-entry"),
            SignatureError::EmptyStruct => write!(f, "struct must have at least one field"),
            SignatureError::DictEntryArity => write!(f, "dict-entry must have exactly two children"),
            SignatureError::DictEntryKeyNotBasic => write!(f, "dict-entry key must be a basic type"),
            SignatureError::DictEntryNotInArray => {
                write!(f, "dict-entry may only appear as an array element")
            }
            SignatureError::ExceededDepth => write!(f, "signature nesting exceeds the maximum depth"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// A validated, borrowed D-Bus signature.
///
/// A `Signature` may describe zero or more single complete types back to
/// back (as in a header-fields signature of `a(yv)`, or a method call's
/// argument list), or it may itself be a single complete type.
#[derive(PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Signature {
    bytes: [u8],
}

impl Signature {
    /// The empty signature.
    pub const EMPTY: &'static Signature = Signature::new_const(b"");
    /// `y`
    pub const BYTE: &'static Signature = Signature::new_const(b"y");
    /// `b`
    pub const BOOLEAN: &'static Signature = Signature::new_const(b"b");
    /// `n`
    pub const INT16: &'static Signature = Signature::new_const(b"n");
    /// `q`
    pub const UINT16: &'static Signature = Signature::new_const(b"q");
    /// `i`
    pub const INT32: &'static Signature = Signature::new_const(b"i");
    /// `u`
    pub const UINT32: &'static Signature = Signature::new_const(b"u");
    /// `x`
    pub const INT64: &'static Signature = Signature::new_const(b"x");
    /// `t`
    pub const UINT64: &'static Signature = Signature::new_const(b"t");
    /// `d`
    pub const DOUBLE: &'static Signature = Signature::new_const(b"d");
    /// `s`
    pub const STRING: &'static Signature = Signature::new_const(b"s");
    /// `o`
    pub const OBJECT_PATH: &'static Signature = Signature::new_const(b"o");
    /// `g`
    pub const SIGNATURE: &'static Signature = Signature::new_const(b"g");
    /// `h`
    pub const UNIX_FD: &'static Signature = Signature::new_const(b"h");
    /// `v`
    pub const VARIANT: &'static Signature = Signature::new_const(b"v");

    /// Parse and validate a signature from its ASCII wire representation.
    ///
    /// # Examples
    ///
    /// ```
    /// use dbus_peer_core::Signature;
    ///
    /// assert!(Signature::parse("(ii)").is_ok());
    /// assert!(Signature::parse("aai").is_ok());
    /// assert!(Signature::parse("a{sv}").is_ok());
    /// assert!(Signature::parse("v").is_ok());
    ///
    /// assert!(Signature::parse("aa").is_err());
    /// assert!(Signature::parse("(ii").is_err());
    /// assert!(Signature::parse("ii)").is_err());
    /// assert!(Signature::parse("a{vs}").is_err());
    /// ```
    pub fn parse(s: &str) -> Result<&Signature, SignatureError> {
        Self::new(s.as_bytes())
    }

    /// Validate and wrap a byte slice as a [`Signature`].
    pub fn new(bytes: &[u8]) -> Result<&Signature, SignatureError> {
        validate(bytes)?;
        // SAFETY: `Signature` is `repr(transparent)` over `[u8]`.
        Ok(unsafe { &*(bytes as *const [u8] as *const Signature) })
    }

    /// Construct a `Signature` from a byte slice known to be valid at
    /// compile time. Only used for the built-in constants above.
    #[doc(hidden)]
    pub const fn new_const(bytes: &'static [u8]) -> &'static Signature {
        // SAFETY: `Signature` is `repr(transparent)` over `[u8]`; callers of
        // this hidden constructor are this module's own constants, which are
        // all valid single complete types.
        unsafe { &*(bytes as *const [u8] as *const Signature) }
    }

    /// The raw bytes of this signature.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The length of this signature in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Test whether this signature is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Split this signature into its top-level single complete types.
    ///
    /// # Examples
    ///
    /// ```
    /// use dbus_peer_core::Signature;
    ///
    /// let sig = Signature::parse("ys(ii)").unwrap();
    /// let parts: Vec<&str> = sig.children().map(|c| std::str::from_utf8(c.as_bytes()).unwrap()).collect();
    /// assert_eq!(parts, vec!["y", "s", "(ii)"]);
    /// ```
    pub fn children(&self) -> Children<'_> {
        Children { rest: &self.bytes }
    }

    /// The number of top-level single complete types in this signature.
    pub fn quantity(&self) -> usize {
        self.children().count()
    }

    /// The alignment in bytes (1, 2, 4 or 8) that a value of this
    /// signature's first type must be stored at.
    ///
    /// Panics if the signature is empty; callers should check
    /// [`Signature::is_empty`] first.
    pub fn alignment(&self) -> u8 {
        alignment_of(self.bytes[0])
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match core::str::from_utf8(&self.bytes) {
            Ok(s) => write!(f, "Signature({s:?})"),
            Err(_) => write!(f, "Signature({:?})", self.bytes),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match core::str::from_utf8(&self.bytes) {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "{:?}", self.bytes),
        }
    }
}

impl ToOwned for Signature {
    type Owned = SignatureBuf;

    fn to_owned(&self) -> SignatureBuf {
        SignatureBuf {
            bytes: self.bytes.to_vec(),
        }
    }
}

impl PartialEq<str> for Signature {
    fn eq(&self, other: &str) -> bool {
        self.bytes == *other.as_bytes()
    }
}

impl PartialEq<&str> for Signature {
    fn eq(&self, other: &&str) -> bool {
        self.bytes == *other.as_bytes()
    }
}

/// An iterator over the top-level single complete types of a [`Signature`].
pub struct Children<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Children<'a> {
    type Item = &'a Signature;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }

        let len = single_complete_type_len(self.rest).expect("signature is pre-validated");
        let (head, tail) = self.rest.split_at(len);
        self.rest = tail;
        Some(unsafe { &*(head as *const [u8] as *const Signature) })
    }
}

/// An owned, validated D-Bus signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignatureBuf {
    bytes: Vec<u8>,
}

impl SignatureBuf {
    /// Parse and validate an owned signature.
    pub fn parse(s: &str) -> Result<SignatureBuf, SignatureError> {
        Signature::parse(s).map(Signature::to_owned)
    }

    /// Build an empty, owned signature that types can be appended to.
    pub fn new() -> SignatureBuf {
        SignatureBuf { bytes: Vec::new() }
    }

    /// Append another signature's bytes, failing if the combined length
    /// would exceed the 255-byte wire limit.
    pub fn push_signature(&mut self, other: &Signature) -> Result<(), SignatureError> {
        if self.bytes.len() + other.len() > MAX_LENGTH {
            return Err(SignatureError::too_long());
        }

        self.bytes.extend_from_slice(other.as_bytes());
        Ok(())
    }
}

impl Default for SignatureBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl core::ops::Deref for SignatureBuf {
    type Target = Signature;

    fn deref(&self) -> &Signature {
        // SAFETY: `SignatureBuf` only ever holds bytes that passed `validate`.
        unsafe { &*(self.bytes.as_slice() as *const [u8] as *const Signature) }
    }
}

impl fmt::Display for SignatureBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

/// Alignment in bytes required by a single type code.
fn alignment_of(code: u8) -> u8 {
    match code {
        b'y' | b'g' | b'v' => 1,
        b'n' | b'q' => 2,
        b'b' | b'i' | b'u' | b's' | b'o' | b'h' | b'a' => 4,
        b'x' | b't' | b'd' | b'(' | b'{' => 8,
        _ => 1,
    }
}

/// Test whether a type code names a basic (non-container) type.
fn is_basic(code: u8) -> bool {
    matches!(
        code,
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g' | b'h'
    )
}

/// Validate a full signature (zero or more single complete types back to
/// back), enforcing the type grammar and its depth/length limits.
fn validate(bytes: &[u8]) -> Result<(), SignatureError> {
    if bytes.len() > MAX_LENGTH {
        return Err(SignatureError::too_long());
    }

    let mut rest = bytes;

    while !rest.is_empty() {
        let len = validate_one(rest, 0, 0)?;
        rest = &rest[len..];
    }

    Ok(())
}

/// Validate a single complete type starting at `bytes[0]`, returning its
/// length in bytes. `array_depth`/`struct_depth` track nesting so far.
fn validate_one(bytes: &[u8], array_depth: u32, struct_depth: u32) -> Result<usize, SignatureError> {
    let &code = bytes.first().ok_or(SignatureError::UnterminatedContainer)?;

    if is_basic(code) {
        return Ok(1);
    }

    match code {
        b'v' => Ok(1),
        b'a' => {
            if array_depth + 1 > MAX_ARRAY_DEPTH || array_depth + struct_depth + 1 > 64 {
                return Err(SignatureError::ExceededDepth);
            }

            let rest = &bytes[1..];
            let elem_code = *rest.first().ok_or(SignatureError::UnterminatedContainer)?;

            if elem_code == b'{' {
                let inner_len = validate_dict_entry(rest, array_depth + 1, struct_depth)?;
                Ok(1 + inner_len)
            } else {
                let inner_len = validate_one(rest, array_depth + 1, struct_depth)?;
                Ok(1 + inner_len)
            }
        }
        b'(' => {
            if struct_depth + 1 > MAX_STRUCT_DEPTH || array_depth + struct_depth + 1 > 64 {
                return Err(SignatureError::ExceededDepth);
            }

            let mut offset = 1;
            let mut fields = 0;

            loop {
                let Some(&next) = bytes.get(offset) else {
                    return Err(SignatureError::UnterminatedContainer);
                };

                if next == b')' {
                    break;
                }

                let len = validate_one(&bytes[offset..], array_depth, struct_depth + 1)?;
                offset += len;
                fields += 1;
            }

            if fields == 0 {
                return Err(SignatureError::EmptyStruct);
            }

            Ok(offset + 1)
        }
        b')' | b'}' => Err(SignatureError::UnbalancedContainer),
        b'{' => Err(SignatureError::DictEntryNotInArray),
        other => Err(SignatureError::InvalidTypeCode(other)),
    }
}

/// Validate a `{kv}` dict-entry, which may only be reached from `a{`.
fn validate_dict_entry(bytes: &[u8], array_depth: u32, struct_depth: u32) -> Result<usize, SignatureError> {
    debug_assert_eq!(bytes.first(), Some(&b'{'));

    if struct_depth + 1 > MAX_STRUCT_DEPTH || array_depth + struct_depth + 1 > 64 {
        return Err(SignatureError::ExceededDepth);
    }

    let key_code = *bytes.get(1).ok_or(SignatureError::UnterminatedContainer)?;

    if !is_basic(key_code) {
        return Err(SignatureError::DictEntryKeyNotBasic);
    }

    let key_len = 1;
    let value_offset = 1 + key_len;
    let value_len = validate_one(&bytes[value_offset..], array_depth, struct_depth + 1)?;

    let close_offset = value_offset + value_len;

    match bytes.get(close_offset) {
        Some(b'}') => Ok(close_offset + 1),
        Some(_) => Err(SignatureError::DictEntryArity),
        None => Err(SignatureError::UnterminatedContainer),
    }
}

/// Length in bytes of the single complete type starting at `bytes[0]`,
/// assuming `bytes` is part of an already-validated signature.
fn single_complete_type_len(bytes: &[u8]) -> Option<usize> {
    validate_one(bytes, 0, 0).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_signatures() {
        assert!(Signature::parse("(ii)").is_ok());
        assert!(Signature::parse("aai").is_ok());
        assert!(Signature::parse("a{sv}").is_ok());
        assert!(Signature::parse("v").is_ok());
        assert!(Signature::parse("").is_ok());
    }

    #[test]
    fn rejects_malformed_signatures() {
        assert!(Signature::parse("aa").is_err());
        assert!(Signature::parse("(ii").is_err());
        assert!(Signature::parse("ii)").is_err());
        assert!(Signature::parse("a{vs}").is_err());
    }

    #[test]
    fn rejects_excessive_depth() {
        let too_deep: String = "a".repeat(33) + "y";
        assert_eq!(
            Signature::parse(&too_deep),
            Err(SignatureError::ExceededDepth)
        );
    }

    #[test]
    fn rejects_empty_struct() {
        assert_eq!(Signature::parse("()"), Err(SignatureError::EmptyStruct));
    }

    #[test]
    fn children_split_top_level_types() {
        let sig = Signature::parse("ysa{sv}(ii)").unwrap();
        let lens: Vec<usize> = sig.children().map(|c| c.len()).collect();
        assert_eq!(lens, vec![1, 1, 6, 4]);
        assert_eq!(sig.quantity(), 4);
    }

    #[test]
    fn alignment_matches_type() {
        assert_eq!(Signature::parse("y").unwrap().alignment(), 1);
        assert_eq!(Signature::parse("q").unwrap().alignment(), 2);
        assert_eq!(Signature::parse("u").unwrap().alignment(), 4);
        assert_eq!(Signature::parse("x").unwrap().alignment(), 8);
        assert_eq!(Signature::parse("(ii)").unwrap().alignment(), 8);
        assert_eq!(Signature::parse("a{sv}").unwrap().alignment(), 4);
    }
}
