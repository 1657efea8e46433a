//! Message types and the stream framer.
//!
//! The framer is fed arbitrary-sized chunks as they arrive from the
//! transport and yields complete messages once enough bytes have
//! accumulated; it never reads ahead past the declared length of the
//! message currently being assembled.

use dbus_peer_core::{
    Endianness, Flags, HeaderFieldCode, MessageType, ObjectPath, ObjectPathBuf, Signature,
    SignatureBuf, Value,
};

use crate::buf::{padding_to, AlignedBuf, Cursor, MAX_MESSAGE_LENGTH};
use crate::error::{Error, ErrorKind, Result};
use crate::marshal;

const PREAMBLE_LEN: usize = 12;

/// The decoded header fields present in a message, keyed by their meaning
/// rather than their raw `(code, variant)` representation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderFields {
    /// `PATH`
    pub path: Option<ObjectPathBuf>,
    /// `INTERFACE`
    pub interface: Option<String>,
    /// `MEMBER`
    pub member: Option<String>,
    /// `ERROR_NAME`
    pub error_name: Option<String>,
    /// `REPLY_SERIAL`
    pub reply_serial: Option<u32>,
    /// `DESTINATION`
    pub destination: Option<String>,
    /// `SENDER`, filled in by the bus.
    pub sender: Option<String>,
    /// `SIGNATURE` of the message body; absent means an empty body.
    pub signature: Option<SignatureBuf>,
    /// `UNIX_FDS`, the number of descriptors accompanying the message.
    pub unix_fds: Option<u32>,
}

impl HeaderFields {
    fn set(&mut self, code: HeaderFieldCode, value: Value) -> Result<()> {
        match code {
            HeaderFieldCode::Path => self.path = Some(expect_object_path(value)?),
            HeaderFieldCode::Interface => self.interface = Some(expect_string(value)?),
            HeaderFieldCode::Member => self.member = Some(expect_string(value)?),
            HeaderFieldCode::ErrorName => self.error_name = Some(expect_string(value)?),
            HeaderFieldCode::ReplySerial => self.reply_serial = Some(expect_u32(value)?),
            HeaderFieldCode::Destination => self.destination = Some(expect_string(value)?),
            HeaderFieldCode::Sender => self.sender = Some(expect_string(value)?),
            HeaderFieldCode::Signature => self.signature = Some(expect_signature(value)?),
            HeaderFieldCode::UnixFds => self.unix_fds = Some(expect_u32(value)?),
        }

        Ok(())
    }

    /// Validate that the required fields for `message_type` are present.
    fn check_required(&self, message_type: MessageType) -> Result<()> {
        match message_type {
            MessageType::MethodCall => {
                require(self.path.is_some(), "PATH")?;
                require(self.member.is_some(), "MEMBER")?;
            }
            MessageType::Signal => {
                require(self.path.is_some(), "PATH")?;
                require(self.interface.is_some(), "INTERFACE")?;
                require(self.member.is_some(), "MEMBER")?;
            }
            MessageType::MethodReturn => {
                require(self.reply_serial.is_some(), "REPLY_SERIAL")?;
            }
            MessageType::Error => {
                require(self.reply_serial.is_some(), "REPLY_SERIAL")?;
                require(self.error_name.is_some(), "ERROR_NAME")?;
            }
        }

        Ok(())
    }

    /// Header fields in the stable, ascending-field-code order this crate
    /// always encodes in. The wire format leaves field order unspecified;
    /// a stable order round-trips cleanly and matches what real bus
    /// daemons emit.
    fn entries(&self) -> Vec<(HeaderFieldCode, Value)> {
        let mut out = Vec::new();

        if let Some(path) = &self.path {
            out.push((
                HeaderFieldCode::Path,
                Value::Variant(Box::new(Value::Basic(dbus_peer_core::BasicValue::ObjectPath(
                    path.clone(),
                )))),
            ));
        }
        if let Some(interface) = &self.interface {
            out.push((HeaderFieldCode::Interface, string_variant(interface)));
        }
        if let Some(member) = &self.member {
            out.push((HeaderFieldCode::Member, string_variant(member)));
        }
        if let Some(error_name) = &self.error_name {
            out.push((HeaderFieldCode::ErrorName, string_variant(error_name)));
        }
        if let Some(reply_serial) = self.reply_serial {
            out.push((HeaderFieldCode::ReplySerial, u32_variant(reply_serial)));
        }
        if let Some(destination) = &self.destination {
            out.push((HeaderFieldCode::Destination, string_variant(destination)));
        }
        if let Some(sender) = &self.sender {
            out.push((HeaderFieldCode::Sender, string_variant(sender)));
        }
        if let Some(signature) = &self.signature {
            out.push((
                HeaderFieldCode::Signature,
                Value::Variant(Box::new(Value::Basic(dbus_peer_core::BasicValue::Signature(
                    signature.clone(),
                )))),
            ));
        }
        if let Some(unix_fds) = self.unix_fds {
            out.push((HeaderFieldCode::UnixFds, u32_variant(unix_fds)));
        }

        out
    }
}

fn string_variant(s: &str) -> Value {
    Value::Variant(Box::new(Value::Basic(dbus_peer_core::BasicValue::String(
        s.to_owned(),
    ))))
}

fn u32_variant(v: u32) -> Value {
    Value::Variant(Box::new(Value::Basic(dbus_peer_core::BasicValue::UInt32(v))))
}

fn expect_string(value: Value) -> Result<String> {
    match unwrap_variant(value) {
        Value::Basic(dbus_peer_core::BasicValue::String(s)) => Ok(s),
        _ => Err(ErrorKind::Corrupted("header field had the wrong type").into()),
    }
}

fn expect_object_path(value: Value) -> Result<ObjectPathBuf> {
    match unwrap_variant(value) {
        Value::Basic(dbus_peer_core::BasicValue::ObjectPath(p)) => Ok(p),
        _ => Err(ErrorKind::Corrupted("header field had the wrong type").into()),
    }
}

fn expect_u32(value: Value) -> Result<u32> {
    match unwrap_variant(value) {
        Value::Basic(dbus_peer_core::BasicValue::UInt32(v)) => Ok(v),
        _ => Err(ErrorKind::Corrupted("header field had the wrong type").into()),
    }
}

fn expect_signature(value: Value) -> Result<SignatureBuf> {
    match unwrap_variant(value) {
        Value::Basic(dbus_peer_core::BasicValue::Signature(s)) => Ok(s),
        _ => Err(ErrorKind::Corrupted("header field had the wrong type").into()),
    }
}

fn unwrap_variant(value: Value) -> Value {
    match value {
        Value::Variant(inner) => *inner,
        other => other,
    }
}

fn require(present: bool, name: &'static str) -> Result<()> {
    if present {
        Ok(())
    } else {
        Err(ErrorKind::MissingHeaderField(name).into())
    }
}

/// A fully decoded message header.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    /// Endianness the message was encoded with.
    pub endianness: Endianness,
    /// The message kind.
    pub message_type: MessageType,
    /// Flags set on this message.
    pub flags: Flags,
    /// The serial this message was sent with. Never zero.
    pub serial: u32,
    /// The length of the body, in bytes.
    pub body_length: u32,
    /// The decoded optional header fields.
    pub fields: HeaderFields,
}

/// A message received from the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// The decoded header.
    pub header: MessageHeader,
    /// The decoded body, one [`Value`] per top-level type in the body
    /// signature.
    pub body: Vec<Value>,
}

/// A message ready to be sent, with its serial already assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// The header to encode. `body_length` is overwritten at encode time.
    pub header: MessageHeader,
    /// The body values to encode, matching `header.fields.signature`.
    pub body: Vec<Value>,
}

/// Builds an [`OutboundMessage`], enforcing the fields each message type
/// requires before a serial is assigned.
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    message_type: Option<MessageType>,
    flags: Flags,
    fields: HeaderFields,
    body: Vec<Value>,
}

impl MessageBuilder {
    /// Start building a method call to `member` on `path`.
    pub fn method_call(path: &ObjectPath, member: impl Into<String>) -> Self {
        let mut builder = Self::default();
        builder.message_type = Some(MessageType::MethodCall);
        builder.fields.path = Some(path.to_owned());
        builder.fields.member = Some(member.into());
        builder
    }

    /// Start building a signal emission of `member` on `path`.
    pub fn signal(path: &ObjectPath, interface: impl Into<String>, member: impl Into<String>) -> Self {
        let mut builder = Self::default();
        builder.message_type = Some(MessageType::Signal);
        builder.fields.path = Some(path.to_owned());
        builder.fields.interface = Some(interface.into());
        builder.fields.member = Some(member.into());
        builder
    }

    /// Start building a reply to `reply_serial`.
    pub fn method_return(reply_serial: u32) -> Self {
        let mut builder = Self::default();
        builder.message_type = Some(MessageType::MethodReturn);
        builder.fields.reply_serial = Some(reply_serial);
        builder
    }

    /// Start building an error reply to `reply_serial`.
    pub fn error(reply_serial: u32, error_name: impl Into<String>) -> Self {
        let mut builder = Self::default();
        builder.message_type = Some(MessageType::Error);
        builder.fields.reply_serial = Some(reply_serial);
        builder.fields.error_name = Some(error_name.into());
        builder
    }

    /// Set the destination bus name.
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.fields.destination = Some(destination.into());
        self
    }

    /// Set the interface, for method calls (signals already require one).
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.fields.interface = Some(interface.into());
        self
    }

    /// Set message flags.
    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the body values, deriving the body signature from them.
    pub fn body(mut self, body: Vec<Value>) -> Self {
        self.body = body;
        self
    }

    /// Assign `serial` and produce the finished message.
    pub fn build(mut self, serial: u32) -> Result<OutboundMessage> {
        if serial == 0 {
            return Err(ErrorKind::ZeroSerial.into());
        }

        let message_type = self
            .message_type
            .expect("builder always set via a constructor");

        if !self.body.is_empty() {
            let mut sig = SignatureBuf::new();

            for value in &self.body {
                sig.push_signature(&value.signature())?;
            }

            self.fields.signature = Some(sig);
        }

        self.fields.check_required(message_type)?;

        let header = MessageHeader {
            endianness: Endianness::NATIVE,
            message_type,
            flags: self.flags,
            serial,
            body_length: 0,
            fields: self.fields,
        };

        Ok(OutboundMessage {
            header,
            body: self.body,
        })
    }
}

/// Encode a complete wire frame for `message`.
pub fn encode_frame(message: &OutboundMessage) -> Result<Vec<u8>> {
    let endianness = message.header.endianness;

    let mut body_buf = AlignedBuf::new(0);
    for value in &message.body {
        marshal::encode(&mut body_buf, endianness, value)?;
    }
    let body = body_buf.into_vec();

    if body.len() as u64 > MAX_MESSAGE_LENGTH as u64 {
        return Err(ErrorKind::FrameTooLarge(body.len() as u32).into());
    }

    let mut buf = AlignedBuf::new(0);
    buf.extend_from_slice(&[
        endianness.as_byte(),
        message.header.message_type.as_byte(),
        message.header.flags.as_byte(),
        1,
    ]);

    let body_len_bytes = encode_u32(body.len() as u32, endianness);
    buf.extend_from_slice(&body_len_bytes);

    let serial_bytes = encode_u32(message.header.serial, endianness);
    buf.extend_from_slice(&serial_bytes);

    let fields_value = Value::Array(
        Signature::new_const(b"(yv)").to_owned(),
        message
            .header
            .fields
            .entries()
            .into_iter()
            .map(|(code, variant)| {
                Value::Struct(vec![
                    Value::Basic(dbus_peer_core::BasicValue::Byte(code.as_byte())),
                    variant,
                ])
            })
            .collect(),
    );

    marshal::encode(&mut buf, endianness, &fields_value)?;
    buf.align(8);

    let total_len = buf.as_slice().len() + body.len();
    if total_len as u64 > MAX_MESSAGE_LENGTH as u64 {
        return Err(ErrorKind::FrameTooLarge(total_len as u32).into());
    }

    buf.extend_from_slice(&body);
    Ok(buf.into_vec())
}

fn encode_u32(v: u32, endianness: Endianness) -> [u8; 4] {
    if endianness == Endianness::NATIVE {
        v.to_ne_bytes()
    } else {
        v.swap_bytes().to_ne_bytes()
    }
}

fn decode_u32(bytes: &[u8], endianness: Endianness) -> u32 {
    let v = u32::from_ne_bytes(bytes.try_into().expect("length checked by caller"));
    if endianness == Endianness::NATIVE {
        v
    } else {
        v.swap_bytes()
    }
}

/// Incrementally assembles [`InboundMessage`]s out of a byte stream.
///
/// Bytes are appended as they arrive via [`Framer::push`] and
/// [`Framer::next_message`] is called in a loop until it returns `None`,
/// meaning more bytes are needed.
#[derive(Debug, Default)]
pub struct Framer {
    carry: Vec<u8>,
}

impl Framer {
    /// Construct an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.carry.extend_from_slice(chunk);
    }

    /// Attempt to decode the next complete message.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Returns `Ok(Some(_))`
    /// with the decoded message advanced past, skipping (with a warning)
    /// any well-formed message of an unrecognized type. A decode error is
    /// fatal for the connection; the caller should not call `push` again.
    pub fn next_message(&mut self) -> Result<Option<InboundMessage>> {
        loop {
            match self.try_decode_one()? {
                Step::NeedMore => return Ok(None),
                Step::Skipped(consumed) => {
                    self.carry.drain(..consumed);
                    tracing::warn!("dropping message of unrecognized type");
                    continue;
                }
                Step::Message(consumed, message) => {
                    self.carry.drain(..consumed);
                    return Ok(Some(message));
                }
            }
        }
    }

    fn try_decode_one(&mut self) -> Result<Step> {
        if self.carry.len() < PREAMBLE_LEN {
            return Ok(Step::NeedMore);
        }

        let endianness = Endianness::from_byte(self.carry[0])
            .ok_or_else(|| Error::from(ErrorKind::Corrupted("invalid endianness byte")))?;
        let message_type = MessageType::from_byte(self.carry[1]);
        let flags = Flags::from_byte(self.carry[2]);
        let version = self.carry[3];

        if version != 1 {
            return Err(ErrorKind::UnsupportedProtocol(version).into());
        }

        let body_length = decode_u32(&self.carry[4..8], endianness);
        let serial = decode_u32(&self.carry[8..12], endianness);

        if serial == 0 {
            return Err(ErrorKind::Corrupted("message serial is zero").into());
        }

        if self.carry.len() < PREAMBLE_LEN + 4 {
            return Ok(Step::NeedMore);
        }

        let fields_array_len = decode_u32(&self.carry[12..16], endianness);

        if fields_array_len > crate::buf::MAX_ARRAY_LENGTH {
            return Err(ErrorKind::FrameTooLarge(fields_array_len).into());
        }

        let fields_end = PREAMBLE_LEN
            .checked_add(4)
            .and_then(|n| n.checked_add(fields_array_len as usize))
            .ok_or_else(|| Error::from(ErrorKind::Corrupted("header length overflow")))?;

        let header_end = padding_to(8, fields_end)
            .checked_add(fields_end)
            .ok_or_else(|| Error::from(ErrorKind::Corrupted("header length overflow")))?;

        let total_len = header_end
            .checked_add(body_length as usize)
            .ok_or_else(|| Error::from(ErrorKind::Corrupted("message length overflow")))?;

        if total_len as u64 > MAX_MESSAGE_LENGTH as u64 {
            return Err(ErrorKind::FrameTooLarge(total_len as u32).into());
        }

        if self.carry.len() < total_len {
            return Ok(Step::NeedMore);
        }

        if self.carry[fields_end..header_end].iter().any(|&b| b != 0) {
            return Err(ErrorKind::Corrupted("non-NUL header padding").into());
        }

        let mut cursor = Cursor::new(&self.carry[PREAMBLE_LEN..fields_end], PREAMBLE_LEN);
        let fields_sig = Signature::new_const(b"a(yv)");
        let decoded_fields = marshal::decode(&mut cursor, endianness, fields_sig)?;

        let mut fields = HeaderFields::default();

        let Value::Array(_, entries) = decoded_fields else {
            unreachable!("a(yv) always decodes to Value::Array");
        };

        for entry in entries {
            let Value::Struct(mut parts) = entry else {
                return Err(ErrorKind::Corrupted("header field entry was not a struct").into());
            };

            if parts.len() != 2 {
                return Err(ErrorKind::Corrupted("header field entry had the wrong arity").into());
            }

            let variant = parts.pop().expect("checked len == 2");
            let code_value = parts.pop().expect("checked len == 2");

            let Value::Basic(dbus_peer_core::BasicValue::Byte(code)) = code_value else {
                return Err(ErrorKind::Corrupted("header field code was not a byte").into());
            };

            if let Some(code) = HeaderFieldCode::from_byte(code) {
                fields.set(code, variant)?;
            }
        }

        let Some(message_type) = message_type else {
            return Ok(Step::Skipped(total_len));
        };

        fields.check_required(message_type)?;

        let header = MessageHeader {
            endianness,
            message_type,
            flags,
            serial,
            body_length,
            fields,
        };

        let body_bytes = &self.carry[header_end..total_len];
        let mut body = Vec::new();

        if let Some(sig) = &header.fields.signature {
            let mut cursor = Cursor::new(body_bytes, header_end);

            for child in sig.children() {
                body.push(marshal::decode(&mut cursor, endianness, child)?);
            }

            if cursor.position() != total_len {
                return Err(ErrorKind::Corrupted(
                    "body_length did not match the bytes the SIGNATURE header described",
                )
                .into());
            }
        }

        Ok(Step::Message(
            total_len,
            InboundMessage { header, body },
        ))
    }
}

enum Step {
    NeedMore,
    Skipped(usize),
    Message(usize, InboundMessage),
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbus_peer_core::BasicValue;

    #[test]
    fn hello_call_round_trips_through_the_framer() {
        let message = MessageBuilder::method_call(ObjectPath::new("/org/freedesktop/DBus").unwrap(), "Hello")
            .interface("org.freedesktop.DBus")
            .destination("org.freedesktop.DBus")
            .build(1)
            .unwrap();

        let bytes = encode_frame(&message).unwrap();

        let mut framer = Framer::new();
        framer.push(&bytes);
        let decoded = framer.next_message().unwrap().unwrap();

        assert_eq!(decoded.header.message_type, MessageType::MethodCall);
        assert_eq!(decoded.header.serial, 1);
        assert_eq!(decoded.header.fields.member.as_deref(), Some("Hello"));
        assert_eq!(
            decoded.header.fields.destination.as_deref(),
            Some("org.freedesktop.DBus")
        );
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn method_return_with_body_round_trips() {
        let message = MessageBuilder::method_return(1)
            .body(vec![Value::Basic(BasicValue::String(":1.42".into()))])
            .build(7)
            .unwrap();

        let bytes = encode_frame(&message).unwrap();
        let mut framer = Framer::new();
        framer.push(&bytes[..5]);
        assert!(framer.next_message().unwrap().is_none());
        framer.push(&bytes[5..]);
        let decoded = framer.next_message().unwrap().unwrap();

        assert_eq!(decoded.header.fields.reply_serial, Some(1));
        assert_eq!(
            decoded.body,
            vec![Value::Basic(BasicValue::String(":1.42".into()))]
        );
    }

    #[test]
    fn two_messages_in_one_chunk_both_decode() {
        let first = MessageBuilder::method_call(ObjectPath::ROOT, "Ping").build(1).unwrap();
        let second = MessageBuilder::method_call(ObjectPath::ROOT, "Ping").build(2).unwrap();

        let mut bytes = encode_frame(&first).unwrap();
        bytes.extend_from_slice(&encode_frame(&second).unwrap());

        let mut framer = Framer::new();
        framer.push(&bytes);

        let a = framer.next_message().unwrap().unwrap();
        let b = framer.next_message().unwrap().unwrap();
        assert_eq!(a.header.serial, 1);
        assert_eq!(b.header.serial, 2);
        assert!(framer.next_message().unwrap().is_none());
    }

    #[test]
    fn rejects_wrong_protocol_version() {
        let message = MessageBuilder::method_call(ObjectPath::ROOT, "Ping").build(1).unwrap();
        let mut bytes = encode_frame(&message).unwrap();
        bytes[3] = 2;

        let mut framer = Framer::new();
        framer.push(&bytes);
        assert!(matches!(
            framer.next_message().unwrap_err().kind(),
            ErrorKind::UnsupportedProtocol(2)
        ));
    }

    #[test]
    fn rejects_zero_serial() {
        let message = MessageBuilder::method_call(ObjectPath::ROOT, "Ping").build(1).unwrap();
        let mut bytes = encode_frame(&message).unwrap();
        bytes[8..12].copy_from_slice(&0u32.to_ne_bytes());

        let mut framer = Framer::new();
        framer.push(&bytes);
        assert!(matches!(
            framer.next_message().unwrap_err().kind(),
            ErrorKind::Corrupted(_)
        ));
    }
}
