//! Signature parsing and the self-describing value model for the D-Bus wire
//! protocol.
//!
//! This crate has no dependencies. It describes *what* a D-Bus value looks
//! like (signatures, basic values, containers) but knows nothing about how
//! bytes are read or written — that is [`dbus_peer`]'s job.
//!
//! [`dbus_peer`]: https://docs.rs/dbus-peer

#![deny(missing_docs)]

#[doc(inline)]
pub use self::proto::{Endianness, Flags, HeaderFieldCode, MessageType};
mod proto;

#[doc(inline)]
pub use self::signature::{Signature, SignatureBuf, SignatureError};
mod signature;

#[doc(inline)]
pub use self::object_path::{ObjectPath, ObjectPathBuf, ObjectPathError};
mod object_path;

#[doc(inline)]
pub use self::value::{BasicValue, Value};
mod value;
