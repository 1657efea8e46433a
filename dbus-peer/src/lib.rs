//! An asynchronous D-Bus client for the Tokio ecosystem.
//!
//! `dbus-peer` implements the client half of a D-Bus peer: marshalling,
//! the stream framer, the `SASL` handshake, the connection lifecycle
//! (including the mandatory `Hello` call and optional reconnection), a
//! serial-correlated request/response layer, and a pipeline of named
//! handlers for everything that arrives unsolicited.
//!
//! The wire-format primitives — the signature grammar, the value model,
//! and object paths — live in [`dbus_peer_core`] and are re-exported here
//! for convenience.

#![deny(missing_docs)]

#[doc(inline)]
pub use dbus_peer_core::{
    BasicValue, Endianness, Flags, HeaderFieldCode, MessageType, ObjectPath, ObjectPathBuf,
    ObjectPathError, Signature, SignatureBuf, SignatureError, Value,
};

#[doc(inline)]
pub use self::address::{parse as parse_address, session_bus, system_bus, Endpoint, Family};
pub mod address;

pub(crate) mod buf;

#[doc(inline)]
pub use self::config::{Config, SaslMechanismKind};
mod config;

#[doc(inline)]
pub use self::connection::Connection;
mod connection;

pub(crate) mod correlator;

#[doc(inline)]
pub use self::error::{Error, ErrorKind, Result};
mod error;

#[doc(inline)]
pub use self::lifecycle::LifecycleState;
mod lifecycle;

pub(crate) mod marshal;

#[doc(inline)]
pub use self::message::{
    Framer, HeaderFields, InboundMessage, MessageBuilder, MessageHeader, OutboundMessage,
};
mod message;

#[doc(inline)]
pub use self::pipeline::{Handler, Pipeline, PipelineContext, UserEvent};
mod pipeline;

#[doc(inline)]
pub use self::sasl::{Anonymous, CookieSha1, External, Mechanism};
mod sasl;

#[doc(inline)]
pub use self::transport::{connect as connect_transport, Credentials, TcpTransport, Transport};
#[cfg(unix)]
#[doc(inline)]
pub use self::transport::UnixTransport;
mod transport;
