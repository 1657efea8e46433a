//! Low-level wire constants shared by the marshaller, the framer and the
//! SASL engine.

use core::fmt;

/// Byte order a message was (or will be) encoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Endianness {
    /// Little-endian, the `l` ASCII code in the D-Bus preamble.
    Little = b'l',
    /// Big-endian, the `B` ASCII code in the D-Bus preamble.
    Big = b'B',
}

impl Endianness {
    /// The endianness native to the host this crate is compiled for.
    #[cfg(target_endian = "little")]
    pub const NATIVE: Endianness = Endianness::Little;
    /// The endianness native to the host this crate is compiled for.
    #[cfg(target_endian = "big")]
    pub const NATIVE: Endianness = Endianness::Big;

    /// Decode an endianness byte from the wire.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'l' => Some(Endianness::Little),
            b'B' => Some(Endianness::Big),
            _ => None,
        }
    }

    /// The byte this endianness is encoded as on the wire.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Endianness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endianness::Little => write!(f, "little-endian"),
            Endianness::Big => write!(f, "big-endian"),
        }
    }
}

/// The four message types defined by the D-Bus specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// A method call, which may solicit a `MethodReturn` or `Error`.
    MethodCall = 1,
    /// A reply carrying the return values of a method call.
    MethodReturn = 2,
    /// An error reply to a method call.
    Error = 3,
    /// A signal emission. Never replied to.
    Signal = 4,
}

impl MessageType {
    /// Decode a message type byte, returning `None` for unknown/extension
    /// type codes (spec: these are ignored rather than rejected).
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }

    /// The byte this message type is encoded as on the wire.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Flags carried in the message preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    /// No flags set.
    pub const NONE: Flags = Flags(0);
    /// The sender does not expect (and will not wait for) a reply.
    pub const NO_REPLY_EXPECTED: Flags = Flags(0x1);
    /// The bus must not auto-start a service to deliver this message.
    pub const NO_AUTO_START: Flags = Flags(0x2);
    /// The caller is prepared to wait for an interactive authorization
    /// dialog, relaxing any timeout the caller would otherwise apply.
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: Flags = Flags(0x4);

    /// Build flags from a raw wire byte, masking off unknown bits.
    pub fn from_byte(byte: u8) -> Flags {
        Flags(byte & 0x7)
    }

    /// The raw wire byte for these flags.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Test whether `self` contains all bits set in `other`.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Header field type codes, as assigned by the D-Bus specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
#[non_exhaustive]
pub enum HeaderFieldCode {
    /// Object path the message is being sent to or emitted from.
    Path = 1,
    /// Interface the member belongs to.
    Interface = 2,
    /// Member (method or signal) name.
    Member = 3,
    /// Name of the error, for `Error` messages.
    ErrorName = 4,
    /// Serial this message is a reply to.
    ReplySerial = 5,
    /// Unique or well-known name of the destination.
    Destination = 6,
    /// Unique name of the sender, filled in by the bus.
    Sender = 7,
    /// Signature of the message body.
    Signature = 8,
    /// Number of Unix file descriptors accompanying the message.
    UnixFds = 9,
}

impl HeaderFieldCode {
    /// Decode a header field code, if it is one this implementation knows
    /// about. Unknown codes are a forward-compatible extension point and
    /// are ignored by callers rather than rejected.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Path),
            2 => Some(Self::Interface),
            3 => Some(Self::Member),
            4 => Some(Self::ErrorName),
            5 => Some(Self::ReplySerial),
            6 => Some(Self::Destination),
            7 => Some(Self::Sender),
            8 => Some(Self::Signature),
            9 => Some(Self::UnixFds),
            _ => None,
        }
    }

    /// The raw wire byte for this header field code.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}
