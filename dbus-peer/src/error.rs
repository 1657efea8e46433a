use core::fmt;
use std::io;

use dbus_peer_core::{ObjectPathError, SignatureError};

use crate::lifecycle::LifecycleState;

/// Result alias using an [`Error`] as the error type by default.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// An error raised by this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    #[inline]
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Self { kind }
    }

    /// Borrow the structured error kind, for callers that want to match on
    /// specific failure modes rather than the string rendering.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl From<SignatureError> for Error {
    #[inline]
    fn from(error: SignatureError) -> Self {
        Self::new(ErrorKind::InvalidSignature(error))
    }
}

impl From<ObjectPathError> for Error {
    #[inline]
    fn from(error: ObjectPathError) -> Self {
        Self::new(ErrorKind::InvalidObjectPath(error))
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Self {
        Self::new(ErrorKind::Transport(error))
    }
}

impl From<core::str::Utf8Error> for Error {
    #[inline]
    fn from(error: core::str::Utf8Error) -> Self {
        Self::new(ErrorKind::InvalidUtf8(error))
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::Transport(e) => write!(f, "transport error: {e}"),
            ErrorKind::UnsupportedAddress(addr) => write!(f, "unsupported D-Bus address: {addr}"),
            ErrorKind::UnsupportedProtocol(version) => {
                write!(f, "unsupported protocol version {version}")
            }
            ErrorKind::AuthFailed { mechanism, reason } => {
                write!(f, "SASL authentication failed ({mechanism}): {reason}")
            }
            ErrorKind::Corrupted(location) => write!(f, "corrupted message: {location}"),
            ErrorKind::FrameTooLarge(len) => write!(f, "frame of {len} bytes exceeds the limit"),
            ErrorKind::ExceededDepth => write!(f, "signature or value nesting exceeds the limit"),
            ErrorKind::InvalidSignature(e) => write!(f, "invalid signature: {e}"),
            ErrorKind::InvalidObjectPath(e) => write!(f, "invalid object path: {e}"),
            ErrorKind::InvalidUtf8(e) => write!(f, "invalid UTF-8: {e}"),
            ErrorKind::BusError {
                name,
                message,
                reply_serial,
            } => write!(f, "{name} (reply to #{reply_serial}): {message}"),
            ErrorKind::Timeout { serial, elapsed } => {
                write!(f, "method call #{serial} timed out after {elapsed:?}")
            }
            ErrorKind::Closed => write!(f, "connection is closed"),
            ErrorKind::NotActive(state) => write!(f, "connection is not active (state: {state})"),
            ErrorKind::MissingHeaderField(name) => write!(f, "missing required header field {name}"),
            ErrorKind::ZeroSerial => write!(f, "message serial must not be zero"),
            ErrorKind::UnixFdsUnsupported => {
                write!(f, "message carries UNIX_FDS but the transport cannot pass file descriptors")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Transport(e) => Some(e),
            ErrorKind::InvalidSignature(e) => Some(e),
            ErrorKind::InvalidObjectPath(e) => Some(e),
            ErrorKind::InvalidUtf8(e) => Some(e),
            _ => None,
        }
    }
}

/// The specific failure a [`Error`] wraps.
///
/// `Transport` and stream-level corruption typically fail the whole
/// connection; `BusError` and `Timeout` fail only the call that triggered
/// them.
#[derive(Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The underlying socket failed.
    Transport(io::Error),
    /// A connect address used a form this implementation cannot dial
    /// (e.g. a listen-only address).
    UnsupportedAddress(String),
    /// The peer's protocol major version was not `1`.
    UnsupportedProtocol(u8),
    /// Every configured SASL mechanism was rejected by the server.
    AuthFailed {
        /// The last mechanism attempted.
        mechanism: &'static str,
        /// Why authentication failed.
        reason: String,
    },
    /// A framing or marshalling invariant was violated on the stream.
    Corrupted(&'static str),
    /// A frame, array, or body exceeded its configured/wire limit.
    FrameTooLarge(u32),
    /// Array or struct nesting within a signature or value exceeded the
    /// maximum allowed depth.
    ExceededDepth,
    /// A signature failed to parse.
    InvalidSignature(SignatureError),
    /// An object path failed to validate.
    InvalidObjectPath(ObjectPathError),
    /// A string failed strict UTF-8 validation.
    InvalidUtf8(core::str::Utf8Error),
    /// A well-formed `Error` reply was received for an outstanding call.
    BusError {
        /// The D-Bus error name, e.g. `org.freedesktop.DBus.Error.ServiceUnknown`.
        name: String,
        /// The human-readable error message, if the error carried one.
        message: String,
        /// The serial of the call this is a reply to.
        reply_serial: u32,
    },
    /// A pending reply was not received within its timeout.
    Timeout {
        /// The serial of the call that timed out.
        serial: u32,
        /// How long the caller waited before timing out.
        elapsed: core::time::Duration,
    },
    /// The connection was closed, or is being closed, while the operation
    /// was outstanding.
    Closed,
    /// An operation that requires an active connection was attempted before
    /// the lifecycle FSM reached [`LifecycleState::Active`].
    NotActive(LifecycleState),
    /// A required header field was missing for the message type.
    MissingHeaderField(&'static str),
    /// A message serial of zero was encountered.
    ZeroSerial,
    /// A message carries `UNIX_FDS` but the active transport cannot pass
    /// file descriptors.
    UnixFdsUnsupported,
}

